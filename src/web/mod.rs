pub mod auth;
pub mod files;
pub mod hooks;
pub mod images;
pub mod landing;
pub mod models;
pub mod notifications;
pub mod responses;
pub mod router;
pub mod state;
pub mod templates;
pub mod uploads;

pub use responses::{ApiMessage, internal_error, json_error};
pub use state::AppState;
pub use templates::{render_dashboard_page, render_login_page};
