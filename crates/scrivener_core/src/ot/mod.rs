//! Operation model and transformation engine.

mod client;
mod edit;
mod transform;

pub use client::{ClientDocument, Submission};
pub use edit::{Edit, apply_all, apply_to_str};
pub use transform::{Tie, transform, transform_against_history, transform_pair, transform_position};
