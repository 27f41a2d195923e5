//! 数据分区 slice 解码
//!
//! 数据分区把一个 video packet 拆成三段: 分区 A 放宏块类型与
//! MV (I 帧为 DC), 分区 B 放 CBPY/ac_pred (P 帧补 DC), 分区 C 放
//! AC 纹理. A 与 B 之间由 dc_marker/motion_marker 分隔, 丢包时
//! 可以保住已收到的分区.

use log::error;
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::tables::{DC_MARKER, DQUANT_TAB, MOTION_MARKER};
use super::types::{MbType, MotionVector, PictureType, SliceState, SpriteMode};
use super::vlc::{self, McbpcI, McbpcP};

impl Mpeg4Decoder {
    /// 分区 A: I 帧解宏块类型与 DC, P/S 帧解宏块类型与 MV
    ///
    /// 返回本 slice 解出的宏块数.
    fn decode_partition_a(&mut self, reader: &mut BitReader) -> MeiResult<usize> {
        let mut count = 0usize;
        self.first_slice_line = true;

        while self.mb_y < self.mb_height {
            while self.mb_x < self.mb_width {
                let xy = self.mb_y * self.mb_width + self.mb_x;
                if self.mb_x == self.resync_mb_x && self.mb_y == self.resync_mb_y + 1 {
                    self.first_slice_line = false;
                }

                if self.pic.picture_type == PictureType::I {
                    let (dquant, cbp_chroma) = loop {
                        if reader.peek_bits(19)? == DC_MARKER {
                            return Ok(count);
                        }
                        match vlc::decode_mcbpc_i(reader) {
                            Ok(McbpcI::Stuffing) => continue,
                            Ok(McbpcI::Mb { mb_type, cbp_chroma }) => {
                                break (mb_type == MbType::IntraQ, cbp_chroma);
                            }
                            Err(e) => {
                                error!("mcbpc 损坏于 {} {}", self.mb_x, self.mb_y);
                                return Err(e);
                            }
                        }
                    };

                    self.cbp_table[xy] = cbp_chroma & 3;
                    self.mbs[xy].mb_type = if dquant { MbType::IntraQ } else { MbType::Intra };
                    if dquant {
                        let dq = DQUANT_TAB[reader.read_bits(2)? as usize];
                        self.set_qscale((self.qscale as i32 + dq as i32).clamp(1, 31) as u8);
                    }
                    self.qscale_table[xy] = self.qscale;
                    self.decode_partition_dc(reader, xy)?;
                } else if self.decode_partition_a_mb_p(reader, xy)? {
                    return Ok(count);
                }
                count += 1;
                self.mb_x += 1;
            }
            self.mb_x = 0;
            self.mb_y += 1;
        }
        Ok(count)
    }

    /// 分区 A 里一个 I/P-intra 宏块的 6 个 DC (方向存入位掩码)
    fn decode_partition_dc(&mut self, reader: &mut BitReader, xy: usize) -> MeiResult<()> {
        let mut dir_mask = 0u8;
        for i in 0..6 {
            let (_, dir) = self.decode_dc(reader, i).map_err(|e| {
                error!("DC 损坏于 {} {}", self.mb_x, self.mb_y);
                e
            })?;
            dir_mask <<= 1;
            if dir == super::types::PredDir::Top {
                dir_mask |= 1;
            }
        }
        self.pred_dir_table[xy] = dir_mask;
        Ok(())
    }

    /// 分区 A 的 P/S 宏块: 类型与 MV
    ///
    /// 碰到 motion_marker 时返回 true 且不消费位.
    fn decode_partition_a_mb_p(&mut self, reader: &mut BitReader, xy: usize) -> MeiResult<bool> {
        let gmc = self.pic.picture_type == PictureType::S && self.seq.sprite == SpriteMode::Gmc;

        let (mb_type_raw, cbp_chroma) = loop {
            if reader.peek_bits(17)? == MOTION_MARKER {
                return Ok(true);
            }
            if reader.read_bit()? != 0 {
                // 跳过宏块
                if gmc {
                    let mv = MotionVector {
                        x: self.gmc_average_mv(0, self.mb_x, self.mb_y) as i16,
                        y: self.gmc_average_mv(1, self.mb_x, self.mb_y) as i16,
                    };
                    self.mbs[xy].mb_type = MbType::GmcSkip;
                    self.mbs[xy].mvs = [mv; 4];
                } else {
                    self.mbs[xy].mb_type = MbType::Skip;
                    self.mbs[xy].mvs = [MotionVector::default(); 4];
                }
                self.mv_cache[xy] = self.mbs[xy].mvs;
                return Ok(false);
            }
            match vlc::decode_mcbpc_p(reader) {
                Ok(McbpcP::Stuffing) => continue,
                Ok(McbpcP::Mb { mb_type, cbp_chroma }) => break (mb_type, cbp_chroma),
                Err(e) => {
                    error!("mcbpc 损坏于 {} {}", self.mb_x, self.mb_y);
                    return Err(e);
                }
            }
        };

        let dquant = matches!(mb_type_raw, MbType::InterQ | MbType::IntraQ);
        // dquant 位暂存在 cbp_table 第 3 位, 分区 B 读完再清掉
        self.cbp_table[xy] = (cbp_chroma & 3) | if dquant { 8 } else { 0 };

        if mb_type_raw.is_intra() {
            self.mbs[xy].mb_type = mb_type_raw;
            self.mbs[xy].mvs = [MotionVector::default(); 4];
            self.mv_cache[xy] = [MotionVector::default(); 4];
            return Ok(false);
        }

        let mcsel = if gmc && mb_type_raw != MbType::Inter4V {
            reader.read_bit()? != 0
        } else {
            false
        };

        if mb_type_raw != MbType::Inter4V {
            let mv = if mcsel {
                self.mbs[xy].mb_type = MbType::Gmc;
                MotionVector {
                    x: self.gmc_average_mv(0, self.mb_x, self.mb_y) as i16,
                    y: self.gmc_average_mv(1, self.mb_x, self.mb_y) as i16,
                }
            } else {
                self.mbs[xy].mb_type = mb_type_raw;
                self.decode_motion_vector(reader, 0, self.pic.f_code)?
            };
            self.mbs[xy].mvs = [mv; 4];
            self.mv_cache[xy] = [mv; 4];
        } else {
            self.mbs[xy].mb_type = MbType::Inter4V;
            for i in 0..4 {
                let mv = self.decode_motion_vector(reader, i, self.pic.f_code)?;
                self.mbs[xy].mvs[i] = mv;
                self.mv_cache[xy][i] = mv;
            }
        }
        Ok(false)
    }

    /// 分区 B: I 帧解 ac_pred/CBPY, P/S 帧补 intra DC 与 CBPY
    fn decode_partition_b(&mut self, reader: &mut BitReader, mb_count: usize) -> MeiResult<()> {
        let mut count = 0usize;
        self.mb_x = self.resync_mb_x;
        self.mb_y = self.resync_mb_y;
        self.first_slice_line = true;

        while count < mb_count {
            while count < mb_count && self.mb_x < self.mb_width {
                let xy = self.mb_y * self.mb_width + self.mb_x;
                if self.mb_x == self.resync_mb_x && self.mb_y == self.resync_mb_y + 1 {
                    self.first_slice_line = false;
                }
                count += 1;

                if self.pic.picture_type == PictureType::I {
                    let ac_pred = reader.read_bit()? != 0;
                    let cbpy = vlc::decode_cbpy(reader).map_err(|e| {
                        error!("cbpy 损坏于 {} {}", self.mb_x, self.mb_y);
                        e
                    })?;
                    self.cbp_table[xy] |= cbpy << 2;
                    self.mbs[xy].ac_pred = ac_pred;
                } else if self.mbs[xy].mb_type.is_intra() {
                    let ac_pred = reader.read_bit()? != 0;
                    let cbpy = vlc::decode_cbpy(reader).map_err(|e| {
                        error!("I cbpy 损坏于 {} {}", self.mb_x, self.mb_y);
                        e
                    })?;
                    if self.cbp_table[xy] & 8 != 0 {
                        let dq = DQUANT_TAB[reader.read_bits(2)? as usize];
                        self.set_qscale((self.qscale as i32 + dq as i32).clamp(1, 31) as u8);
                    }
                    self.qscale_table[xy] = self.qscale;
                    self.decode_partition_dc(reader, xy)?;
                    self.cbp_table[xy] = (self.cbp_table[xy] & 3) | (cbpy << 2);
                    self.mbs[xy].ac_pred = ac_pred;
                } else if self.mbs[xy].mb_type.is_skip() {
                    self.qscale_table[xy] = self.qscale;
                    self.cbp_table[xy] = 0;
                } else {
                    let cbpy = vlc::decode_cbpy(reader).map_err(|e| {
                        error!("P cbpy 损坏于 {} {}", self.mb_x, self.mb_y);
                        e
                    })?;
                    if self.cbp_table[xy] & 8 != 0 {
                        let dq = DQUANT_TAB[reader.read_bits(2)? as usize];
                        self.set_qscale((self.qscale as i32 + dq as i32).clamp(1, 31) as u8);
                    }
                    self.qscale_table[xy] = self.qscale;
                    self.cbp_table[xy] = (self.cbp_table[xy] & 3) | ((cbpy ^ 0x0F) << 2);
                }

                self.mb_x += 1;
            }
            if count >= mb_count {
                break;
            }
            self.mb_x = 0;
            self.mb_y += 1;
        }
        Ok(())
    }

    /// 解码一个 slice 的分区 A 与 B, 成功后 mb_num_left 记录待解纹理的宏块数
    pub(super) fn decode_partitions(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        let start_x = self.mb_x;
        let start_y = self.mb_y;
        let mb_total = self.mb_width * self.mb_height;

        let mb_num = self.decode_partition_a(reader)?;
        if mb_num == 0 {
            return Err(MeiError::InvalidData("分区 A 为空".into()));
        }
        if self.resync_mb_x + self.resync_mb_y * self.mb_width + mb_num > mb_total {
            error!("slice 超出帧边界");
            return Err(MeiError::InvalidData("分区 slice 超出帧边界".into()));
        }
        self.mb_num_left = mb_num as i32;

        if self.pic.picture_type == PictureType::I {
            // 9 位 mcbpc 填充码
            while reader.peek_bits(9)? == 1 {
                reader.skip_bits(9)?;
            }
            if reader.read_bits(19)? != DC_MARKER {
                error!("I 分区后缺少 dc_marker ({} {})", self.mb_x, self.mb_y);
                return Err(MeiError::InvalidData("dc_marker 缺失".into()));
            }
        } else {
            // 10 位 mcbpc 填充码
            while reader.peek_bits(10)? == 1 {
                reader.skip_bits(10)?;
            }
            if reader.read_bits(17)? != MOTION_MARKER {
                error!("P 分区后缺少 motion_marker ({} {})", self.mb_x, self.mb_y);
                return Err(MeiError::InvalidData("motion_marker 缺失".into()));
            }
        }

        self.decode_partition_b(reader, mb_num)?;

        // 分区 C 从 slice 起点重新走一遍
        self.mb_x = start_x;
        self.mb_y = start_y;
        Ok(())
    }

    /// 分区 C: 按分区 A/B 攒下的状态解一个宏块的纹理
    pub(super) fn decode_partitioned_mb(&mut self, reader: &mut BitReader) -> MeiResult<SliceState> {
        let xy = self.mb_y * self.mb_width + self.mb_x;
        if self.mb_x == self.resync_mb_x && self.mb_y == self.resync_mb_y + 1 {
            self.first_slice_line = false;
        }

        let mb_type = self.mbs[xy].mb_type;
        let mut cbp = self.cbp_table[xy] as u32;
        let use_intra_dc_vlc = self.qscale < self.pic.intra_dc_threshold;

        if self.qscale_table[xy] != self.qscale {
            let q = self.qscale_table[xy];
            self.set_qscale(q);
        }

        if mb_type.is_skip() {
            self.mbskip_table[xy] = if mb_type == MbType::GmcSkip { 0 } else { 1 };
        } else {
            self.mbskip_table[xy] = 0;
            let ac_pred = self.mbs[xy].ac_pred;
            let intra = mb_type.is_intra();
            for i in 0..6 {
                let mut blk = [0i16; 64];
                self.decode_block(reader, &mut blk, i, cbp & 32 != 0, intra, use_intra_dc_vlc, ac_pred)
                    .map_err(|e| {
                        error!("纹理损坏于 {} {} (intra={})", self.mb_x, self.mb_y, intra);
                        e
                    })?;
                self.mbs[xy].blocks[i] = blk;
                cbp += cbp;
            }
        }
        self.mbs[xy].quant = self.qscale;
        self.mbs[xy].cbp = self.cbp_table[xy];

        self.mb_num_left -= 1;
        if self.mb_num_left <= 0 {
            if self.next_resync_mb(reader) != 0 {
                return Ok(SliceState::End);
            }
            return Ok(SliceState::NoEnd);
        }
        if self.next_resync_mb(reader) != 0 {
            let delta = if self.mb_x + 1 == self.mb_width { 2 } else { 1 };
            if xy + delta < self.cbp_table.len() && self.cbp_table[xy + delta] != 0 {
                return Ok(SliceState::End);
            }
        }
        Ok(SliceState::Ok)
    }
}
