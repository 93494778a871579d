use serde::{Deserialize, Serialize};

/// The speaker of a message. Tool messages carry results back to the model
/// and always reference the call they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}
