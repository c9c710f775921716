pub mod app;
pub mod bootstrap;
pub mod forms;
pub mod route_guard;
pub mod session;
pub mod todos;
