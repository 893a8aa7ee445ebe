// Adapters layer: concrete implementations of the domain ports
// (token endpoint, consent flow, language model, local files).

pub mod authorizer;
pub mod llm;
pub mod oauth;
pub mod storage;
