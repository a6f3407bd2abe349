pub mod anthropic;
pub mod openai_compatible;
pub mod router;

pub use anthropic::AnthropicClient;
pub use openai_compatible::{AuthStyle, OpenAICompatibleClient};
pub use router::build_chat_client;
