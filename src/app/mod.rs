// Front-end contract: turns an inbound request into a pipeline call and the
// outcome into a status code plus JSON body.

pub mod handlers;

pub use handlers::{bearer_token, handle_create_script, handle_prompt, ApiResponse};
