pub mod attendance;
pub mod auth;
pub mod backup;
pub mod certificates;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod exams;
pub mod expenses;
pub mod fees;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod timetable;
