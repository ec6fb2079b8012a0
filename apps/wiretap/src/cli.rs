//! 命令行参数定义与解析。

use clap::Parser;
use std::path::PathBuf;

/// 被动抓取 TCP 流量并按应用层协议解码。
#[derive(Parser, Debug)]
#[command(name = "wiretap")]
#[command(version, about, long_about = None)]
#[command(override_usage = "wiretap [OPTIONS] <DEVICE> <DECODER> [PARAMS]...\n       wiretap --read <FILE> <DECODER> [PARAMS]...")]
pub struct Args {
    /// 离线回放 pcap/pcapng 文件（此时不需要 DEVICE）
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    pub read: Option<PathBuf>,

    /// 列出可用解码器
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// 网卡名、解码器名与解码器参数（如 `-p 3306`）
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// 抓包来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Device(String),
    File(PathBuf),
}

/// 解析后的调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub input: Input,
    pub decoder: String,
    pub params: Vec<String>,
}

impl Args {
    /// 按是否指定 `--read` 拆分位置参数。
    pub fn invocation(&self) -> Result<Invocation, String> {
        let mut rest = self.args.iter().cloned();
        let input = match &self.read {
            Some(path) => Input::File(path.clone()),
            None => Input::Device(rest.next().ok_or("missing <DEVICE>")?),
        };
        let decoder = rest.next().ok_or("missing <DECODER>")?;
        Ok(Invocation {
            input,
            decoder,
            params: rest.collect(),
        })
    }
}
