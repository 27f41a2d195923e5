//! # mei-codec
//!
//! Mei 多媒体框架解码器库, 提供 MPEG-4 Part 2 (ISO/IEC 14496-2) 视频码流的
//! 图像头与宏块层解析.
//!
//! 本 crate 对标 FFmpeg 的 libavcodec 中的 mpeg4video 解码路径, 但只负责
//! 码流语法层: 序列/图像头解析、宏块模式与运动向量解码、DC/AC 预测、
//! 残差系数解码、GMC sprite 轨迹解算与容错重同步. 像素重建 (IDCT, 运动
//! 补偿) 由上层协作方完成.
//!
//! ## 使用示例
//!
//! ```rust
//! use mei_codec::decoders::mpeg4::Mpeg4Decoder;
//!
//! let mut decoder = Mpeg4Decoder::new();
//! // 逐访问单元送入码流数据 (含起始码)
//! let _ = decoder.decode(&[0x00, 0x00, 0x01, 0xB6]);
//! ```

pub mod decoders;
pub mod progress;

pub use progress::RowProgress;
