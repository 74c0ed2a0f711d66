pub mod scorer;
pub mod selector;

pub use scorer::{Candidate, WindowKind};
pub use selector::{SelectOptions, SelectionDecision, Selector};
