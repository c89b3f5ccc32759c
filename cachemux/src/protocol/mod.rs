pub mod frame;
pub mod opcode;
pub mod status;

pub use frame::{try_decode_response, RequestFrame, ResponseFrame};
pub use opcode::Opcode;
pub use status::Status;
