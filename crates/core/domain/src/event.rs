//! 解码事件：解码器对外唯一的输出。

use crate::flow::{Direction, FlowId};
use crate::now_epoch_ms;
use serde::Serialize;

/// 事件类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Query,
    Response,
    Error,
    Notice,
}

/// 解码事件（发出后不可变）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub emitted_at_ms: i64,
    pub flow: FlowId,
    pub direction: Direction,
    pub decoder: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        flow: FlowId,
        direction: Direction,
        decoder: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            emitted_at_ms: now_epoch_ms(),
            flow,
            direction,
            decoder: decoder.into(),
            summary: summary.into(),
            detail: None,
        }
    }

    /// 附加结构化明细。
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}
