//! 管理面HTTP接口 / Admin HTTP surface.

pub mod v1;
