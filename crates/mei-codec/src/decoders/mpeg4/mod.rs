//! MPEG-4 Part 2 (ISO/IEC 14496-2) 图像头与宏块层解码器
//!
//! 覆盖 Simple / Advanced Simple / Simple Studio profile 的码流语法层:
//!
//! - 序列层: VOS / Visual Object / VOL / GOP / user_data 头部
//! - 图像层: VOP 头部, 时间基推导, GMC sprite 轨迹解算
//! - 宏块层: I/P/B/S 宏块模式, 运动向量, DC/AC 预测, 残差系数
//! - 容错: resync marker, 数据分区 (含 RVLC), 出错区间标记
//! - 兼容: DivX/XviD/lavc 编码器识别与历史缺陷工作区,
//!   DivX packed bitstream 重排
//! - studio profile: 10 位 4:2:2/4:4:4 的 DCT 与 DPCM 宏块
//!
//! 像素重建 (IDCT, 运动补偿) 不在范围内, 输出为逐宏块解码记录.
//!
//! ## 模块结构
//!
//! - `types`: 配置与输出结构 (SequenceConfig, PictureConfig, MacroblockRecord 等)
//! - `tables`: 固定常量表 (扫描序, DC 缩放, 默认量化矩阵)
//! - `vlc`: VLC 码表与解码函数
//! - `header`: 序列层头部解析
//! - `vop`: VOP 头部与时间基
//! - `gmc`: sprite 轨迹与仿射参数
//! - `predict`: 帧内 DC/AC 预测平面
//! - `motion`: 运动向量解码与预测
//! - `block`: 8x8 残差块解码 (含 RVLC)
//! - `macroblock`: I/P/B/S 宏块层
//! - `partition`: 数据分区 (分区 A/B/C)
//! - `resync`: resync marker 与 video packet
//! - `studio`: studio profile 的头部与宏块层
//! - `quirks`: 编码器识别与缺陷工作区

mod block;
mod gmc;
mod header;
mod macroblock;
mod motion;
mod partition;
mod predict;
mod quirks;
mod resync;
mod studio;
mod tables;
#[cfg(test)]
mod tests;
mod types;
mod vlc;
mod vop;

use log::{debug, info, warn};
use mei_core::{BitReader, MeiError, MeiResult};

use crate::progress::RowProgress;

use gmc::GmcState;
use predict::PredictionState;
use studio::next_start_code_studio;
use tables::{
    C_DC_SCALE_TABLE, DEFAULT_INTER_MATRIX, DEFAULT_INTRA_MATRIX, GOP_STARTCODE,
    SLICE_STARTCODE, USER_DATA_STARTCODE, VISUAL_OBJ_STARTCODE, VOP_STARTCODE, VOS_STARTCODE,
    Y_DC_SCALE_TABLE,
};
use vop::VopOutcome;

pub use types::{
    BMbMode, BugFlags, DecodedFrame, EncoderInfo, FrameOutcome, MacroblockRecord, MbType,
    MotionVector, PictureConfig, PictureType, PredDir, SequenceConfig, SkipReason, SliceState,
    SpriteMode, StudioMacroblock, VolShape,
};

/// DivX packed bitstream 中占位 N-VOP 的尺寸上限 (字节)
const MAX_NVOP_SIZE: usize = 19;

/// 头部扫描的终态
enum HeaderStatus {
    /// 到达 VOP, 头部已解析完毕
    Vop,
    /// 本访问单元无帧输出
    Skip(SkipReason),
    /// 只消费了序列层头部
    NoFrame,
}

/// MPEG-4 Part 2 码流解码器
///
/// 逐访问单元调用 [`decode`](Self::decode), 内部维护跨帧状态
/// (序列配置, 参考帧 MV/跳过表, 时间基, 编码器兼容标志).
pub struct Mpeg4Decoder {
    // 序列与帧级配置
    seq: SequenceConfig,
    pic: PictureConfig,
    has_vol: bool,
    /// 严格模式: 可疑码流直接报错而非尽力恢复
    strict: bool,

    // 容器与编码器识别
    codec_tag: [u8; 4],
    encoder: EncoderInfo,
    bugs: BugFlags,
    profile: i32,
    level: i32,
    pixel_aspect: (u8, u8),
    bit_rate: u64,
    video_range: Option<bool>,
    color_description: Option<(u8, u8, u8)>,

    // 量化矩阵与系数排布
    intra_matrix: [u16; 64],
    inter_matrix: [u16; 64],
    /// studio: 色度 intra 矩阵 (非 studio 与 intra_matrix 同步)
    chroma_intra_matrix: [u16; 64],
    idct_permutation: [u8; 64],
    xvid_idct_active: bool,
    /// NO_PADDING 自动检测的累计评分
    padding_bug_score: i64,

    // 时间基
    time_base: i64,
    last_time_base: i64,
    time: i64,
    last_non_b_time: i64,
    pp_time: i64,
    pb_time: i64,
    pp_field_time: i64,
    pb_field_time: i64,
    t_frame: i64,
    picture_number: i64,

    // 量化状态
    qscale: u8,
    y_dc_scale: u8,
    c_dc_scale: u8,

    // 宏块坐标
    mb_width: usize,
    mb_height: usize,
    mb_x: usize,
    mb_y: usize,
    resync_mb_x: usize,
    resync_mb_y: usize,
    first_slice_line: bool,

    // 子状态
    gmc: GmcState,
    pred: PredictionState,

    // 帧内逐宏块表
    qscale_table: Vec<u8>,
    pred_dir_table: Vec<u8>,
    cbp_table: Vec<u8>,
    mv_cache: Vec<[MotionVector; 4]>,
    ref_mv_cache: Vec<[MotionVector; 4]>,
    b_mvs_forward: [MotionVector; 4],
    b_mvs_backward: [MotionVector; 4],
    /// B 帧的 MV 预测器, [方向][场]
    b_last_mv: [[MotionVector; 2]; 2],
    mbskip_table: Vec<u8>,
    ref_mbskip: Vec<u8>,
    mbs: Vec<MacroblockRecord>,
    /// 数据分区 slice 中待解纹理的宏块数
    mb_num_left: i32,
    /// 参考帧的行进度 (B 帧 direct 模式等待其共定位行)
    ref_progress: RowProgress,

    // studio profile
    last_dc: [i32; 3],
    q_scale_type: bool,
    studio_mbs: Vec<StudioMacroblock>,

    // DivX packed bitstream
    packed_pending: Option<Vec<u8>>,
    showed_packed_warning: bool,
}

impl Mpeg4Decoder {
    pub fn new() -> Self {
        let ref_progress = RowProgress::new();
        ref_progress.finish();
        Self {
            seq: SequenceConfig::default(),
            pic: PictureConfig::default(),
            has_vol: false,
            strict: false,
            codec_tag: [0; 4],
            encoder: EncoderInfo::default(),
            bugs: BugFlags::AUTODETECT,
            profile: -1,
            level: -1,
            pixel_aspect: (0, 1),
            bit_rate: 0,
            video_range: None,
            color_description: None,
            intra_matrix: DEFAULT_INTRA_MATRIX,
            inter_matrix: DEFAULT_INTER_MATRIX,
            chroma_intra_matrix: DEFAULT_INTRA_MATRIX,
            idct_permutation: std::array::from_fn(|i| i as u8),
            xvid_idct_active: false,
            padding_bug_score: 0,
            time_base: 0,
            last_time_base: 0,
            time: 0,
            last_non_b_time: 0,
            pp_time: 0,
            pb_time: 0,
            pp_field_time: 0,
            pb_field_time: 0,
            t_frame: 0,
            picture_number: 0,
            qscale: 1,
            y_dc_scale: 8,
            c_dc_scale: 8,
            mb_width: 0,
            mb_height: 0,
            mb_x: 0,
            mb_y: 0,
            resync_mb_x: 0,
            resync_mb_y: 0,
            first_slice_line: true,
            gmc: GmcState::default(),
            pred: PredictionState::default(),
            qscale_table: Vec::new(),
            pred_dir_table: Vec::new(),
            cbp_table: Vec::new(),
            mv_cache: Vec::new(),
            ref_mv_cache: Vec::new(),
            b_mvs_forward: [MotionVector::default(); 4],
            b_mvs_backward: [MotionVector::default(); 4],
            b_last_mv: [[MotionVector::default(); 2]; 2],
            mbskip_table: Vec::new(),
            ref_mbskip: Vec::new(),
            mbs: Vec::new(),
            mb_num_left: 0,
            ref_progress,
            last_dc: [0; 3],
            q_scale_type: false,
            studio_mbs: Vec::new(),
            packed_pending: None,
            showed_packed_warning: false,
        }
    }

    /// 容器层的 fourcc, 用于编码器识别回退与若干格式怪癖
    pub fn set_codec_tag(&mut self, tag: [u8; 4]) {
        self.codec_tag = tag;
    }

    /// 严格模式下可疑码流直接报错
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// 序列层身份信息 (VOS 的 profile 与 level, -1 表示未见)
    pub fn profile_level(&self) -> (i32, i32) {
        (self.profile, self.level)
    }

    /// 最近一次 VOL 解析出的序列配置
    pub fn sequence(&self) -> &SequenceConfig {
        &self.seq
    }

    /// 像素宽高比 ((0, 1) 表示未指定)
    pub fn pixel_aspect(&self) -> (u8, u8) {
        self.pixel_aspect
    }

    /// vbv 参数声明的码率 (bit/s, 0 表示未声明)
    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    /// video_signal_type 声明的色彩信息 (量化范围与三元色彩描述)
    pub fn color_info(&self) -> (Option<bool>, Option<(u8, u8, u8)>) {
        (self.video_range, self.color_description)
    }

    /// 设置帧尺寸并重建所有逐宏块表
    pub(super) fn set_dimensions(&mut self, width: u32, height: u32) {
        self.seq.width = width;
        self.seq.height = height;
        self.mb_width = (width as usize).div_ceil(16);
        self.mb_height = (height as usize).div_ceil(16);
        let total = self.mb_width * self.mb_height;

        self.pred.resize(self.mb_width, self.mb_height);
        self.qscale_table = vec![0; total];
        self.pred_dir_table = vec![0; total];
        self.cbp_table = vec![0; total];
        self.mv_cache = vec![[MotionVector::default(); 4]; total];
        self.ref_mv_cache = vec![[MotionVector::default(); 4]; total];
        self.mbskip_table = vec![0; total];
        self.ref_mbskip = vec![0; total];
        self.mbs = vec![MacroblockRecord::default(); total];

        let progress = RowProgress::new();
        progress.finish();
        self.ref_progress = progress;

        debug!("尺寸 {}x{} ({}x{} 宏块)", width, height, self.mb_width, self.mb_height);
    }

    /// 设置 qscale 并同步 DC 缩放步长
    pub(super) fn set_qscale(&mut self, qscale: u8) {
        let q = qscale.clamp(1, 31);
        self.qscale = q;
        self.y_dc_scale = Y_DC_SCALE_TABLE[q as usize];
        self.c_dc_scale = C_DC_SCALE_TABLE[q as usize];
    }

    /// 按当前系数排布装载默认量化矩阵
    pub(super) fn load_default_matrices(&mut self) {
        for i in 0..64 {
            let j = self.idct_permutation[i] as usize;
            self.intra_matrix[j] = DEFAULT_INTRA_MATRIX[i];
            self.chroma_intra_matrix[j] = DEFAULT_INTRA_MATRIX[i];
            self.inter_matrix[j] = DEFAULT_INTER_MATRIX[i];
        }
    }

    // ========================================================================
    // 访问单元入口
    // ========================================================================

    /// 解码一个访问单元 (含起始码的完整 packet)
    ///
    /// 纯头部数据 (如容器 extradata 中的 VOL) 返回 [`FrameOutcome::NoFrame`];
    /// DivX packed bitstream 的重排在内部完成, 占位尾帧返回
    /// [`FrameOutcome::Skipped`].
    pub fn decode(&mut self, data: &[u8]) -> MeiResult<FrameOutcome> {
        if data.is_empty() {
            return Ok(FrameOutcome::NoFrame);
        }

        // packed bitstream: 上一包中后置的 VOP 先于本包解码, 本包
        // 通常只是占位 N-VOP. 新段以 VOS 开头说明缓存属多余数据.
        if let Some(pending) = self.packed_pending.take() {
            let mut use_pending =
                self.encoder.divx_packed || data.len() <= MAX_NVOP_SIZE;
            if self.encoder.divx_packed {
                for i in 0..data.len().saturating_sub(3) {
                    if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                        if data[i + 3] == 0xB0 {
                            warn!("丢弃 packed 码流中的多余缓存数据");
                            use_pending = false;
                        }
                        break;
                    }
                }
            }
            if use_pending {
                let (outcome, _) = self.decode_unit(&pending)?;
                self.stash_packed_remainder(data, 0);
                return Ok(outcome);
            }
        }

        let (outcome, consumed) = self.decode_unit(data)?;
        self.stash_packed_remainder(data, consumed);
        Ok(outcome)
    }

    fn decode_unit(&mut self, data: &[u8]) -> MeiResult<(FrameOutcome, usize)> {
        let mut reader = BitReader::new(data);
        let outcome = match self.parse_headers(&mut reader)? {
            HeaderStatus::Vop => {
                self.resolve_workarounds();
                let frame = if self.seq.studio_profile {
                    self.decode_studio_frame(&mut reader)?
                } else {
                    self.decode_frame(&mut reader)?
                };
                FrameOutcome::Decoded(frame)
            }
            HeaderStatus::Skip(reason) => FrameOutcome::Skipped(reason),
            HeaderStatus::NoFrame => FrameOutcome::NoFrame,
        };
        Ok((outcome, reader.byte_position()))
    }

    /// packed bitstream: 把本包中后置的 I/B VOP 缓存到下一次调用
    fn stash_packed_remainder(&mut self, data: &[u8], consumed: usize) {
        if !self.encoder.divx_packed || data.len() < consumed + 8 {
            return;
        }
        for i in consumed..data.len() - 4 {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 && data[i + 3] == 0xB6 {
                // 首两位为 VOP 类型, 后置帧只会是 I 或 B
                if data[i + 4] & 0x40 == 0 {
                    if !self.showed_packed_warning {
                        info!("检测到 packed B 帧码流, 按 DivX 约定重排");
                        self.showed_packed_warning = true;
                    }
                    self.packed_pending = Some(data[consumed..].to_vec());
                }
                break;
            }
        }
    }

    // ========================================================================
    // 头部扫描
    // ========================================================================

    /// 逐字节扫描起始码直至 VOP, 途中消费一切序列层头部
    fn parse_headers(&mut self, reader: &mut BitReader) -> MeiResult<HeaderStatus> {
        // WV1F 容器变体: "WV0" + 0xF0 前缀后直接跟无起始码的 VOP 载荷
        if &self.codec_tag == b"WV1F"
            && reader.bits_left() >= 32
            && reader.peek_bits(24)? == 0x575630
        {
            reader.skip_bits(24)?;
            if reader.read_bits(8)? == 0xF0 {
                return self.parse_vop(reader);
            }
        }

        let mut startcode = 0xFFu32;
        let mut seen_vol = false;
        loop {
            if reader.bits_left() < 8 {
                // 1 字节的占位包是 DivX/XviD 的跳帧约定
                if (reader.data().len() == 1
                    && (self.encoder.divx_version >= 0 || self.encoder.xvid_build >= 0))
                    || &self.codec_tag == b"QMP4"
                {
                    debug!("占位跳帧包");
                    return Ok(HeaderStatus::Skip(SkipReason::PackedTrailer));
                }
                return Ok(HeaderStatus::NoFrame);
            }
            let v = reader.read_bits(8)?;
            startcode = (startcode << 8) | v;
            if startcode & 0xFFFF_FF00 != 0x100 {
                continue;
            }

            match startcode {
                0x120..=0x12F => {
                    if seen_vol {
                        warn!("忽略重复的 VOL 头部");
                    } else {
                        seen_vol = true;
                        self.decode_vol_header(reader)?;
                    }
                }
                USER_DATA_STARTCODE => self.decode_user_data(reader)?,
                GOP_STARTCODE => self.decode_gop_header(reader)?,
                VOS_STARTCODE => {
                    self.decode_vos_header(reader)?;
                    if self.seq.studio_profile {
                        next_start_code_studio(reader);
                        self.extension_and_user_data(reader, 0)?;
                    }
                }
                VISUAL_OBJ_STARTCODE => {
                    if self.seq.studio_profile {
                        self.decode_studio_visual_object(reader)?;
                    } else {
                        self.decode_visual_object(reader)?;
                    }
                }
                VOP_STARTCODE => return self.parse_vop(reader),
                _ => {}
            }

            reader.align_to_byte();
            startcode = 0xFF;
        }
    }

    fn parse_vop(&mut self, reader: &mut BitReader) -> MeiResult<HeaderStatus> {
        if self.seq.studio_profile {
            if !self.has_vol {
                return Err(MeiError::InvalidData("studio 流缺少 VOL 头部".into()));
            }
            self.decode_studio_vop_header(reader)?;
            return Ok(HeaderStatus::Vop);
        }
        match self.decode_vop_header(reader)? {
            VopOutcome::Proceed => Ok(HeaderStatus::Vop),
            VopOutcome::Skip(reason) => Ok(HeaderStatus::Skip(reason)),
        }
    }

    // ========================================================================
    // 帧解码驱动
    // ========================================================================

    fn decode_frame(&mut self, reader: &mut BitReader) -> MeiResult<DecodedFrame> {
        if self.mb_width == 0 || self.mb_height == 0 {
            return Err(MeiError::InvalidData("帧尺寸未知 (缺少 VOL 头部)".into()));
        }
        let total = self.mb_width * self.mb_height;
        let is_b = self.pic.picture_type == PictureType::B;

        for rec in &mut self.mbs {
            *rec = MacroblockRecord::default();
        }
        if !is_b {
            self.mbskip_table.fill(0);
        }
        self.pred.reset();
        self.mb_x = 0;
        self.mb_y = 0;
        self.resync_mb_x = 0;
        self.resync_mb_y = 0;
        self.first_slice_line = true;
        self.b_last_mv = [[MotionVector::default(); 2]; 2];
        self.mb_num_left = 0;
        self.set_qscale(self.pic.qscale);

        loop {
            let slice_start = (self.mb_y * self.mb_width + self.mb_x).min(total);
            match self.decode_slice_run(reader) {
                Ok(true) => break,
                Ok(false) => {
                    // slice 干净结束, 还有后续 video packet
                    let cur = (self.mb_y * self.mb_width + self.mb_x).min(total);
                    if self.resync(reader).is_err() {
                        self.mark_error_range(cur, total);
                        break;
                    }
                    let next = self.mb_y * self.mb_width + self.mb_x;
                    if next > cur {
                        self.mark_error_range(cur, next);
                    }
                }
                Err(e) => {
                    warn!(
                        "slice 解码失败于宏块 ({}, {}): {}",
                        self.mb_x, self.mb_y, e
                    );
                    if self.resync(reader).is_ok() {
                        let end = self.mb_y * self.mb_width + self.mb_x;
                        self.mark_error_range(slice_start, end.max(slice_start));
                    } else {
                        self.mark_error_range(slice_start, total);
                        break;
                    }
                }
            }
        }

        self.finish_frame_padding(reader);

        // 非 B 帧成为下一帧的参考: MV 与跳过表换入参考槽
        if !is_b {
            std::mem::swap(&mut self.mv_cache, &mut self.ref_mv_cache);
            std::mem::swap(&mut self.mbskip_table, &mut self.ref_mbskip);
            let progress = RowProgress::new();
            progress.finish();
            self.ref_progress = progress;
        }

        let mb_errored = self.mbs.iter().filter(|m| m.in_error).count();
        Ok(DecodedFrame {
            picture_type: self.pic.picture_type,
            pts: self.pic.pts,
            mb_width: self.mb_width,
            mb_height: self.mb_height,
            macroblocks: self.mbs.clone(),
            studio_macroblocks: Vec::new(),
            mb_decoded: total - mb_errored,
            mb_errored,
        })
    }

    /// 解码一个 slice (video packet); 返回是否已到帧尾
    fn decode_slice_run(&mut self, reader: &mut BitReader) -> MeiResult<bool> {
        if self.pic.partitioned {
            self.decode_partitions(reader)?;
        }
        loop {
            if self.mb_y >= self.mb_height {
                return Ok(true);
            }
            self.first_slice_line = self.mb_y == self.resync_mb_y;

            let state = if self.pic.partitioned {
                self.decode_partitioned_mb(reader)?
            } else {
                self.decode_mb(reader)?
            };

            self.mb_x += 1;
            if self.mb_x == self.mb_width {
                self.mb_x = 0;
                self.mb_y += 1;
            }

            match state {
                SliceState::Ok => {}
                SliceState::End => {
                    self.probe_padding_bug(reader);
                    return Ok(self.mb_y >= self.mb_height);
                }
                SliceState::NoEnd => {
                    return Err(MeiError::InvalidData(
                        "slice 结束位置与宏块计数不符".into(),
                    ));
                }
            }
        }
    }

    /// 部分编码器在 slice 间填充 0x4010 签名, 以此累计 NO_PADDING 评分
    fn probe_padding_bug(&mut self, reader: &mut BitReader) {
        if !self.bugs.contains(BugFlags::AUTODETECT) || self.seq.data_partitioned {
            return;
        }
        if reader.bits_left() >= 48 && reader.peek_bits(24).unwrap_or(0) == 0x4010 {
            self.padding_bug_score += 32;
        }
    }

    /// 帧尾残留位检查与 NO_PADDING 自动检测的落定
    fn finish_frame_padding(&mut self, reader: &mut BitReader) {
        let left = reader.bits_left() as i64;
        let mut max_extra = 7i64;
        if self.bugs.contains(BugFlags::NO_PADDING) {
            max_extra += 256 * 256 * 256 * 64;
        }
        if left > max_extra {
            warn!("丢弃帧尾 {} 位残留数据", left);
        } else {
            self.padding_bug_score -= 1;
        }

        if self.bugs.contains(BugFlags::AUTODETECT) {
            if self.padding_bug_score > -2 && !self.seq.data_partitioned {
                self.bugs |= BugFlags::NO_PADDING;
            } else {
                self.bugs.remove(BugFlags::NO_PADDING);
            }
        }
    }

    /// studio profile 帧: 逐 slice 解码 DCT/DPCM 宏块
    fn decode_studio_frame(&mut self, reader: &mut BitReader) -> MeiResult<DecodedFrame> {
        if self.mb_width == 0 || self.mb_height == 0 {
            return Err(MeiError::InvalidData("帧尺寸未知 (缺少 VOL 头部)".into()));
        }
        self.studio_mbs.clear();
        self.mb_x = 0;
        self.mb_y = 0;

        loop {
            next_start_code_studio(reader);
            if reader.bits_left() < 32 || reader.peek_bits(32)? != SLICE_STARTCODE {
                break;
            }
            self.decode_studio_slice_header(reader)?;
            loop {
                let state = self.decode_studio_mb(reader)?;
                self.mb_x += 1;
                if self.mb_x == self.mb_width {
                    self.mb_x = 0;
                    self.mb_y += 1;
                }
                if state == SliceState::End || self.mb_y >= self.mb_height {
                    break;
                }
            }
        }

        let studio_macroblocks = std::mem::take(&mut self.studio_mbs);
        let mb_decoded = studio_macroblocks.len();
        Ok(DecodedFrame {
            picture_type: self.pic.picture_type,
            pts: self.pic.pts,
            mb_width: self.mb_width,
            mb_height: self.mb_height,
            macroblocks: Vec::new(),
            studio_macroblocks,
            mb_decoded,
            mb_errored: 0,
        })
    }
}

impl Default for Mpeg4Decoder {
    fn default() -> Self {
        Self::new()
    }
}
