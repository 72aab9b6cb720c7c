pub mod assessments;
pub mod assignments;
pub mod attendance;
pub mod carry_marks;
pub mod classes;
pub mod core;
pub mod scoring;
pub mod students;
