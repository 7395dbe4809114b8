pub mod ids;
pub mod time_utils;
