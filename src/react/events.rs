//! 编排循环事件：供 CLI 日志或外部订阅者展示节点、路由、动作与判定

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 节点开始执行
    NodeStarted { step: u32, node: String },
    /// 路由决策
    RouteDecided { from: String, to: String, reason: String },
    /// 动作交给沙箱或验证器
    ActionDispatched {
        id: u64,
        tool: String,
        args: serde_json::Value,
    },
    /// 动作结果（预览，避免过长）
    Observation {
        id: u64,
        exit_status: Option<i32>,
        preview: String,
    },
    Verdict { summary: String },
    /// 转写被压缩
    Compressed { summarized: usize, new_facts: usize },
    /// 运行结束
    Terminated { status: String, reason: String },
}
