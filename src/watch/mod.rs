pub mod decision;
pub mod evaluator;
pub mod models;
