//! エージェント本体（パイプラインと会話履歴）

pub mod history;
pub mod pipeline;

pub use history::ChatHistory;
pub use pipeline::AgentPipeline;
