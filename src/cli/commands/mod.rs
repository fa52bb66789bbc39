mod day;
mod fill;

pub use day::execute_day;
pub use fill::execute_fill;
