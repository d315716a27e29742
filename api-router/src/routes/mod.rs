pub mod liveness;
pub mod popular;
pub mod question;
pub mod readiness;
