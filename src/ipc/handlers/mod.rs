pub mod connections;
pub mod core;
pub mod grades;
pub mod sections;
