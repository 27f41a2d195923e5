//! # Mei (媒)
//!
//! 纯 Rust 实现的 MPEG-4 Part 2 (ISO/IEC 14496-2) 视频码流解析框架.
//!
//! Mei 专注于图像头与宏块层的码流解析:
//! - **序列层**: VOS / Visual Object / VOL / GOP 头解析 (含 Studio Profile)
//! - **图像层**: VOP 头, 时间戳推导, GMC sprite 轨迹解算
//! - **宏块层**: I/P/B/S 宏块模式/运动/残差解码, DC/AC 预测
//! - **容错**: resync marker, 数据分区 (Data Partitioning), 编码器兼容性修正
//!
//! 像素重建 (IDCT/运动补偿) 不在本框架范围内, 解码输出为逐宏块的解析记录.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use mei::codec::decoders::mpeg4::Mpeg4Decoder;
//!
//! let mut decoder = Mpeg4Decoder::new();
//! let access_unit: &[u8] = &[];
//! let outcome = decoder.decode(access_unit);
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `mei-core` | 核心类型与工具 (错误处理, 比特流读取) |
//! | `mei-codec` | MPEG-4 Part 2 解码器 |

/// 核心类型与工具 (对标 libavutil)
pub use mei_core as core;

/// 解码器框架 (对标 libavcodec)
pub use mei_codec as codec;

/// 获取 Mei 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let _ = env_logger::builder().is_test(true).try_init();
        assert!(!version().is_empty());
    }

    #[test]
    fn test_facade_reexports() {
        let mut decoder = codec::decoders::mpeg4::Mpeg4Decoder::new();
        assert!(matches!(
            decoder.decode(&[]).unwrap(),
            codec::decoders::mpeg4::FrameOutcome::NoFrame
        ));
    }
}
