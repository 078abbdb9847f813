mod tensor;

pub use tensor::{Element, Tensor};
