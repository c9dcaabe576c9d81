pub mod common_io;
pub mod tensor_io;
pub mod traits;
