//! Prowl - 自主渗透测试循环的编排与自适应控制
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态、路由、编排器、错误与恢复、运行报告
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 转写、动作历史、持久事实与上下文压缩
//! - **observability**: 日志初始化
//! - **react**: 决策预言机与 Planner / Executor / ToolRunner / Reflector 节点
//! - **signals**: 重复检测与置信度评估
//! - **tools**: 执行沙箱、工具执行器、事实抽取与结果验证

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod signals;
pub mod tools;
