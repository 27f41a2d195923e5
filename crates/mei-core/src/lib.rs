//! # mei-core
//!
//! Mei 多媒体框架核心库, 提供基础类型定义、错误处理和工具函数.
//!
//! 本 crate 对标 FFmpeg 的 libavutil, 为整个 Mei 框架提供底层基础设施.

pub mod bitreader;
pub mod error;

// 重导出常用类型
pub use bitreader::BitReader;
pub use error::{MeiError, MeiResult};
