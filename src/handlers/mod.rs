pub mod health_handlers;
pub mod session_handlers;
pub mod store_handlers;
pub mod video_handlers;
