pub mod backup_exchange;
pub mod core;
pub mod exams;
pub mod import_csv;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod terms;
