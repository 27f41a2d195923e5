//! MPEG-4 Part 2 解码器类型定义
//!
//! 本模块定义贯穿解码流程的三层配置/记录结构:
//! - `SequenceConfig`: 由 VOL 头部产生, 跨帧持久
//! - `PictureConfig`: 由 VOP 头部产生, 每帧一份
//! - `MacroblockRecord`: 宏块层解码输出, 每宏块一份

use bitflags::bitflags;

/// VOP 编码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    /// 帧内编码
    I,
    /// 前向预测
    P,
    /// 双向预测
    B,
    /// Sprite (GMC) 预测
    S,
}

/// VOL sprite 使用模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpriteMode {
    #[default]
    None,
    /// 静态 sprite (不支持解码, 仅解析)
    Static,
    /// 全局运动补偿
    Gmc,
}

/// VOL 形状类型 (仅矩形被完整支持)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolShape {
    #[default]
    Rectangular,
    Binary,
    BinaryOnly,
    Grayscale,
}

/// 宏块类型 (I/P/S-VOP)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MbType {
    #[default]
    Inter,
    InterQ,
    Inter4V,
    Intra,
    IntraQ,
    /// P 帧跳过宏块 (零 MV 复制)
    Skip,
    /// S-VOP 跳过宏块, MV 取全局运动平均
    GmcSkip,
    /// S-VOP 全局运动补偿宏块
    Gmc,
    /// 隔行 16x8 场运动
    InterField,
}

impl MbType {
    pub fn is_intra(self) -> bool {
        matches!(self, MbType::Intra | MbType::IntraQ)
    }

    pub fn is_skip(self) -> bool {
        matches!(self, MbType::Skip | MbType::GmcSkip)
    }
}

/// B 帧宏块模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BMbMode {
    /// 直接模式: MV 从共定位未来帧 MV 按时间比缩放
    Direct,
    /// 双向插值
    Interpolate,
    /// 仅后向预测
    Backward,
    /// 仅前向预测
    Forward,
}

/// 运动向量 (半像素或四分之一像素单位)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

impl MotionVector {
    pub fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }
}

/// DC/AC 预测方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredDir {
    /// 左邻居 (水平预测)
    #[default]
    Left,
    /// 上邻居 (垂直预测)
    Top,
}

bitflags! {
    /// 历史编码器缺陷的工作区标志
    ///
    /// 由 user_data 中的编码器签名与容器 codec tag 推导,
    /// 解码各环节按位查询以复现对应编码器的行为.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BugFlags: u32 {
        /// 启用自动检测 (默认)
        const AUTODETECT = 1 << 0;
        /// XviD 隔行编码缺陷: 无 cbp 时也读 interlaced_dct 位
        const XVID_ILACE = 1 << 1;
        /// UMP4 时间基错误
        const UMP4 = 1 << 2;
        /// 码流尾部无填充
        const NO_PADDING = 1 << 3;
        /// GMC 平均 MV 范围按 quarter_sample 缩减
        const AMV = 1 << 4;
        /// 旧 lavc 的 qpel 插值
        const STD_QPEL = 1 << 5;
        /// DivX 色度 qpel 取整
        const QPEL_CHROMA = 1 << 6;
        /// DivX >502 色度 qpel 取整变体
        const QPEL_CHROMA2 = 1 << 7;
        /// direct 模式块尺寸错误
        const DIRECT_BLOCKSIZE = 1 << 8;
        /// 边缘扩展尺寸错误
        const EDGE = 1 << 9;
        /// 半像素色度取整
        const HPEL_CHROMA = 1 << 10;
        /// DC 不截断到 2047
        const DC_CLIP = 1 << 11;
        /// lavc 3.x 特定版本的边缘插值
        const IEDGE = 1 << 12;
    }
}

/// 从 user_data 识别出的编码器版本信息
///
/// -1 表示未检出.
#[derive(Debug, Clone, Copy)]
pub struct EncoderInfo {
    pub divx_version: i32,
    pub divx_build: i32,
    /// DivX packed bitstream ("p" 后缀)
    pub divx_packed: bool,
    pub xvid_build: i32,
    pub lavc_build: i32,
}

impl Default for EncoderInfo {
    fn default() -> Self {
        Self {
            divx_version: -1,
            divx_build: -1,
            divx_packed: false,
            xvid_build: -1,
            lavc_build: -1,
        }
    }
}

/// VOL 头部产生的序列级配置, 跨帧持久直至下一个 VOL
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub vo_type: u8,
    pub verid: u8,
    pub shape: VolShape,
    pub width: u32,
    pub height: u32,
    /// progressive_sequence (隔行时为 false)
    pub progressive: bool,
    /// vop_time_increment_resolution, 必须非零
    pub time_increment_resolution: u32,
    /// time_increment 字段位宽, 自 resolution 推导
    pub time_increment_bits: u8,
    pub fixed_vop_rate: u32,
    pub sprite: SpriteMode,
    pub num_sprite_warping_points: u8,
    pub sprite_warping_accuracy: u8,
    pub sprite_brightness_change: bool,
    /// vop_quant 字段位宽, 3..=9
    pub quant_precision: u8,
    /// 量化类型: false=H.263, true=MPEG
    pub mpeg_quant: bool,
    pub quarter_sample: bool,
    /// complexity estimation 在 VOP 头部占用的待跳过位数
    pub cplx_estimation_trash_i: u16,
    pub cplx_estimation_trash_p: u16,
    pub cplx_estimation_trash_b: u16,
    pub resync_marker: bool,
    pub data_partitioned: bool,
    pub rvlc: bool,
    pub new_pred: bool,
    pub scalability: bool,
    pub enhancement_type: bool,
    pub vol_control_parameters: bool,
    pub low_delay: bool,
    /// studio profile: 结构不同的 VOL/VOP/宏块语法
    pub studio_profile: bool,
    /// studio: RGB 分量
    pub rgb: bool,
    /// studio: 色度格式 (1=420, 2=422, 3=444)
    pub chroma_format: u8,
    /// studio: 样本位深
    pub bits_per_raw_sample: u8,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            vo_type: 0,
            verid: 1,
            shape: VolShape::Rectangular,
            width: 0,
            height: 0,
            progressive: true,
            time_increment_resolution: 0,
            time_increment_bits: 0,
            fixed_vop_rate: 1,
            sprite: SpriteMode::None,
            num_sprite_warping_points: 0,
            sprite_warping_accuracy: 0,
            sprite_brightness_change: false,
            quant_precision: 5,
            mpeg_quant: false,
            quarter_sample: false,
            cplx_estimation_trash_i: 0,
            cplx_estimation_trash_p: 0,
            cplx_estimation_trash_b: 0,
            resync_marker: false,
            data_partitioned: false,
            rvlc: false,
            new_pred: false,
            scalability: false,
            enhancement_type: false,
            vol_control_parameters: false,
            low_delay: false,
            studio_profile: false,
            rgb: false,
            chroma_format: 1,
            bits_per_raw_sample: 8,
        }
    }
}

/// VOP 头部产生的帧级配置
#[derive(Debug, Clone)]
pub struct PictureConfig {
    pub picture_type: PictureType,
    pub qscale: u8,
    pub f_code: u8,
    pub b_code: u8,
    pub no_rounding: bool,
    /// intra_dc_vlc_thr 查表后的阈值 (与 qscale 比较)
    pub intra_dc_threshold: u8,
    pub top_field_first: bool,
    pub alternate_scan: bool,
    /// 绝对解码时间 (time_base * resolution + time_increment)
    pub time: i64,
    /// resolution 归一后的显示时间戳
    pub pts: i64,
    /// 本帧使用数据分区语法
    pub partitioned: bool,
    /// studio: DCT 精度字段
    pub dct_precision: u8,
    /// studio: intra DC 精度字段
    pub intra_dc_precision: u8,
}

impl Default for PictureConfig {
    fn default() -> Self {
        Self {
            picture_type: PictureType::I,
            qscale: 1,
            f_code: 1,
            b_code: 1,
            no_rounding: false,
            intra_dc_threshold: 99,
            top_field_first: false,
            alternate_scan: false,
            time: 0,
            pts: 0,
            partitioned: false,
            dct_precision: 0,
            intra_dc_precision: 0,
        }
    }
}

/// 单个宏块的解码输出
///
/// 供重建阶段消费; 解码过程中同帧后续宏块只读取
/// 其中的 MV 字段做空间预测.
#[derive(Debug, Clone)]
pub struct MacroblockRecord {
    pub mb_type: MbType,
    pub quant: u8,
    /// 6 位 coded block pattern (Y0..Y3, U, V)
    pub cbp: u8,
    pub ac_pred: bool,
    /// 6 个块各自的 DC 预测方向 (供 AC 预测复用)
    pub pred_dir: [PredDir; 6],
    /// 前向 MV, 每 8x8 块一个 (16x16 模式时复制)
    pub mvs: [MotionVector; 4],
    /// 后向 MV (仅 B 帧)
    pub mvs_backward: [MotionVector; 4],
    /// B 帧宏块模式
    pub b_mode: Option<BMbMode>,
    /// 场预测的参考场选择 (前向 top/bottom, 后向 top/bottom)
    pub field_select: [[bool; 2]; 2],
    pub field_dct: bool,
    /// 残差系数 (zig-zag 反扫描后的自然顺序), 4 亮度 + 2 色度
    pub blocks: [[i16; 64]; 6],
    /// 本宏块残差是否解码出错 (resync 恢复后标记)
    pub in_error: bool,
}

impl Default for MacroblockRecord {
    fn default() -> Self {
        Self {
            mb_type: MbType::Inter,
            quant: 1,
            cbp: 0,
            ac_pred: false,
            pred_dir: [PredDir::Left; 6],
            mvs: [MotionVector::default(); 4],
            mvs_backward: [MotionVector::default(); 4],
            b_mode: None,
            field_select: [[false; 2]; 2],
            field_dct: false,
            blocks: [[0; 64]; 6],
            in_error: false,
        }
    }
}

/// studio profile 宏块的解码输出
///
/// DCT 模式下按色度格式持 6/8/12 个 32 位系数块;
/// DPCM 模式下持三个分量的无损残差平面.
#[derive(Debug, Clone, Default)]
pub struct StudioMacroblock {
    /// DCT 系数块 (10 位样本需要超过 i16 的动态范围)
    pub dct_blocks: Vec<[i32; 64]>,
    /// DPCM 平面 (Y 16x16, 色度按格式缩减)
    pub dpcm_planes: Vec<Vec<i16>>,
    /// DPCM 扫描方向: 1 正向, -1 反向, 0 表示 DCT 模式
    pub dpcm_direction: i8,
}

/// 宏块层的逐块状态信号 (非错误)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceState {
    /// 继续解码下一个宏块
    Ok,
    /// slice 在此宏块后结束, 后续是 resync marker
    End,
    /// slice 数据耗尽但未见 marker
    NoEnd,
}

/// 帧未输出的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// vop_coded == 0
    NotCoded,
    /// B 帧时间参考倒置 (多半因 seek)
    BTimingInversion,
    /// DivX packed bitstream 的 8 字节占位尾帧
    PackedTrailer,
}

/// 一次 decode 调用的结果
#[derive(Debug)]
pub enum FrameOutcome {
    /// 成功解码一帧 (可能含有错误宏块)
    Decoded(DecodedFrame),
    /// 帧被跳过 (信息性, 非错误)
    Skipped(SkipReason),
    /// 仅消费了头部, 无帧输出
    NoFrame,
}

/// 解码完成的一帧宏块数据
#[derive(Debug)]
pub struct DecodedFrame {
    pub picture_type: PictureType,
    pub pts: i64,
    pub mb_width: usize,
    pub mb_height: usize,
    pub macroblocks: Vec<MacroblockRecord>,
    /// studio profile 帧的宏块 (普通帧为空)
    pub studio_macroblocks: Vec<StudioMacroblock>,
    /// 干净解码的宏块数
    pub mb_decoded: usize,
    /// 出错后由 resync 界定的宏块数
    pub mb_errored: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_info_default_undetected() {
        let info = EncoderInfo::default();
        assert_eq!(info.divx_version, -1);
        assert_eq!(info.xvid_build, -1);
        assert_eq!(info.lavc_build, -1);
        assert!(!info.divx_packed);
    }

    #[test]
    fn test_mb_type_intra_classification() {
        assert!(MbType::Intra.is_intra());
        assert!(MbType::IntraQ.is_intra());
        assert!(!MbType::Inter4V.is_intra());
        assert!(!MbType::Gmc.is_intra());
    }
}
