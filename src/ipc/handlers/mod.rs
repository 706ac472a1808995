pub mod attendance;
pub mod core;
pub mod departments;
pub mod enrollment;
pub mod fees;
pub mod marks;
pub mod performance;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod teachers;
pub mod timetable;
