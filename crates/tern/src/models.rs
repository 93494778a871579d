//! These models represent the objects exchanged between the agent, the model
//! gateway, and the toolkits providing capabilities:
//! - openai-style messages/tools, sent from the agent to the LLM
//! - tool requests and results, routed from the agent to the toolkits
//!
//! Wire formats are converted at the provider boundary (see
//! `providers::utils`); everything inside the agent uses these structs.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
