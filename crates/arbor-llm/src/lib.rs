pub mod openai;
pub mod rotating;

pub mod mock;

pub use mock::{MockProvider, MockResponse, ScriptedProvider};
pub use openai::{OpenAiCompatProvider, OpenAiConfig};
pub use rotating::RotatingProvider;
