mod session;

pub use session::{
    require_provider_access, DEVICE_COOKIE, DEVICE_HEADER, SESSION_COOKIE, SESSION_HEADER,
};
