pub mod errors;
pub mod factory;
pub mod logging;
pub mod util;
