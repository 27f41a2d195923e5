//! I/P/S/B 宏块层解码
//!
//! 每个宏块先经 MCBPC/CBPY 得到类型与编码块模式, 再解 MV 与 6 个
//! 8x8 块. 每个宏块结束后探测下一个 resync marker 决定切片去留.

use log::error;
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::tables::DQUANT_TAB;
use super::types::{
    BMbMode, BugFlags, MacroblockRecord, MbType, MotionVector, PictureType, SliceState,
    SpriteMode,
};
use super::vlc::{self, McbpcI, McbpcP};

impl Mpeg4Decoder {
    /// 解码当前坐标处的一个宏块
    pub(super) fn decode_mb(&mut self, reader: &mut BitReader) -> MeiResult<SliceState> {
        match self.pic.picture_type {
            PictureType::I => self.decode_mb_i(reader),
            PictureType::B => self.decode_mb_b(reader),
            _ => self.decode_mb_p(reader),
        }
    }

    fn decode_mb_i(&mut self, reader: &mut BitReader) -> MeiResult<SliceState> {
        let (dquant, cbp_chroma) = loop {
            match vlc::decode_mcbpc_i(reader)? {
                McbpcI::Stuffing => continue,
                McbpcI::Mb { mb_type, cbp_chroma } => {
                    break (mb_type == MbType::IntraQ, cbp_chroma);
                }
            }
        };
        self.decode_intra_mb_body(reader, dquant, cbp_chroma)?;
        self.mb_end(reader)
    }

    /// Intra 宏块体 (I 帧宏块与 P/S 帧内的 intra 宏块共用)
    fn decode_intra_mb_body(
        &mut self,
        reader: &mut BitReader,
        dquant: bool,
        cbp_chroma: u8,
    ) -> MeiResult<()> {
        let xy = self.mb_y * self.mb_width + self.mb_x;
        let ac_pred = reader.read_bit()? != 0;
        let cbpy = vlc::decode_cbpy(reader)?;
        let cbp = ((cbp_chroma & 3) | (cbpy << 2)) as u32;

        let use_intra_dc_vlc = self.qscale < self.pic.intra_dc_threshold;

        if dquant {
            let dq = DQUANT_TAB[reader.read_bits(2)? as usize];
            self.set_qscale((self.qscale as i32 + dq as i32).clamp(1, 31) as u8);
        }
        let field_dct = if !self.seq.progressive {
            reader.read_bit()? != 0
        } else {
            false
        };
        self.qscale_table[xy] = self.qscale;

        let mut rec = MacroblockRecord {
            mb_type: if dquant { MbType::IntraQ } else { MbType::Intra },
            quant: self.qscale,
            cbp: cbp as u8,
            ac_pred,
            field_dct,
            ..Default::default()
        };
        let mut cbp = cbp;
        for i in 0..6 {
            let mut blk = [0i16; 64];
            self.decode_block(reader, &mut blk, i, cbp & 32 != 0, true, use_intra_dc_vlc, ac_pred)?;
            rec.blocks[i] = blk;
            cbp += cbp;
        }

        self.store_mb_mvs([MotionVector::default(); 4]);
        self.mbskip_table[xy] = 0;
        self.mbs[xy] = rec;
        Ok(())
    }

    fn decode_mb_p(&mut self, reader: &mut BitReader) -> MeiResult<SliceState> {
        let xy = self.mb_y * self.mb_width + self.mb_x;
        let gmc = self.pic.picture_type == PictureType::S && self.seq.sprite == SpriteMode::Gmc;

        let (mb_type_raw, cbp_chroma) = loop {
            if reader.read_bit()? != 0 {
                // 未编码宏块; GMC 帧里按全局 MV 运动, 其余情况静止复制
                let mut rec = MacroblockRecord::default();
                if gmc {
                    let mv = MotionVector {
                        x: self.gmc_average_mv(0, self.mb_x, self.mb_y) as i16,
                        y: self.gmc_average_mv(1, self.mb_x, self.mb_y) as i16,
                    };
                    rec.mb_type = MbType::GmcSkip;
                    rec.mvs = [mv; 4];
                    self.mbskip_table[xy] = 0;
                } else {
                    rec.mb_type = MbType::Skip;
                    self.mbskip_table[xy] = 1;
                }
                rec.quant = self.qscale;
                self.qscale_table[xy] = self.qscale;
                self.store_mb_mvs(rec.mvs);
                self.mbs[xy] = rec;
                return self.mb_end(reader);
            }
            match vlc::decode_mcbpc_p(reader)? {
                McbpcP::Stuffing => continue,
                McbpcP::Mb { mb_type, cbp_chroma } => break (mb_type, cbp_chroma),
            }
        };

        let dquant = matches!(mb_type_raw, MbType::InterQ | MbType::IntraQ);
        if mb_type_raw.is_intra() {
            self.decode_intra_mb_body(reader, dquant, cbp_chroma)?;
            return self.mb_end(reader);
        }

        let mcsel = if gmc && mb_type_raw != MbType::Inter4V {
            reader.read_bit()? != 0
        } else {
            false
        };
        let cbpy = vlc::decode_cbpy(reader)? ^ 0x0F;
        let cbp = (((cbp_chroma & 3) | (cbpy << 2)) as u32) & 63;
        if dquant {
            let dq = DQUANT_TAB[reader.read_bits(2)? as usize];
            self.set_qscale((self.qscale as i32 + dq as i32).clamp(1, 31) as u8);
        }
        let field_dct = if !self.seq.progressive
            && (cbp != 0 || self.bugs.contains(BugFlags::XVID_ILACE))
        {
            reader.read_bit()? != 0
        } else {
            false
        };
        self.qscale_table[xy] = self.qscale;

        let mut rec = MacroblockRecord {
            mb_type: mb_type_raw,
            quant: self.qscale,
            cbp: cbp as u8,
            field_dct,
            ..Default::default()
        };

        if mb_type_raw != MbType::Inter4V {
            if mcsel {
                // 16x16 全局运动预测
                let mv = MotionVector {
                    x: self.gmc_average_mv(0, self.mb_x, self.mb_y) as i16,
                    y: self.gmc_average_mv(1, self.mb_x, self.mb_y) as i16,
                };
                rec.mb_type = MbType::Gmc;
                rec.mvs = [mv; 4];
                self.store_mb_mvs(rec.mvs);
            } else if !self.seq.progressive && reader.read_bit()? != 0 {
                // 16x8 场运动预测
                rec.mb_type = MbType::InterField;
                rec.field_select[0][0] = reader.read_bit()? != 0;
                rec.field_select[0][1] = reader.read_bit()? != 0;
                let pred = self.get_pmv(0);
                for i in 0..2 {
                    let mx = self.decode_motion(reader, pred.x, self.pic.f_code)?;
                    let my = self.decode_motion(reader, pred.y / 2, self.pic.f_code)?;
                    rec.mvs[i] = MotionVector { x: mx, y: my };
                }
                // 邻块预测用两场 MV 的 or 取整平均
                let sx = rec.mvs[0].x + rec.mvs[1].x;
                let sy = rec.mvs[0].y + rec.mvs[1].y;
                let avg = MotionVector {
                    x: (sx >> 1) | (sx & 1),
                    y: (sy >> 1) | (sy & 1),
                };
                self.store_mb_mvs([avg; 4]);
            } else {
                let mv = self.decode_motion_vector(reader, 0, self.pic.f_code)?;
                rec.mvs = [mv; 4];
                self.store_mb_mvs(rec.mvs);
            }
        } else {
            // 8x8 模式: 逐块写入缓存, 后续块的预测要看到前面的结果
            for i in 0..4 {
                let mv = self.decode_motion_vector(reader, i, self.pic.f_code)?;
                rec.mvs[i] = mv;
                self.mv_cache[xy][i] = mv;
            }
        }
        self.mbskip_table[xy] = 0;

        let mut cbp = cbp;
        for i in 0..6 {
            let mut blk = [0i16; 64];
            self.decode_block(reader, &mut blk, i, cbp & 32 != 0, false, false, false)?;
            rec.blocks[i] = blk;
            cbp += cbp;
        }
        self.mbs[xy] = rec;
        self.mb_end(reader)
    }

    fn decode_mb_b(&mut self, reader: &mut BitReader) -> MeiResult<SliceState> {
        let xy = self.mb_y * self.mb_width + self.mb_x;

        if self.mb_x == 0 {
            self.b_last_mv = [[MotionVector::default(); 2]; 2];
            self.ref_progress.wait_for(self.mb_y as i32);
        }

        // 未来参考帧里跳过的宏块, 这里同样跳过
        if self.ref_mbskip[xy] != 0 {
            let rec = MacroblockRecord {
                mb_type: MbType::Skip,
                quant: self.qscale,
                ..Default::default()
            };
            self.qscale_table[xy] = self.qscale;
            self.mbs[xy] = rec;
            return self.mb_end(reader);
        }

        let mut rec = MacroblockRecord {
            quant: self.qscale,
            ..Default::default()
        };
        let mut cbp = 0u32;
        let mut b_mode = BMbMode::Direct;
        let mut direct_skip = true;
        let mut interlaced_mv = false;

        let modb1 = reader.read_bit()? != 0;
        if !modb1 {
            direct_skip = false;
            let modb2 = reader.read_bit()? != 0;
            b_mode = vlc::decode_b_mb_mode(reader)?;
            if !modb2 {
                cbp = reader.read_bits(6)?;
            }
            if b_mode != BMbMode::Direct && cbp != 0 {
                let dq = vlc::decode_dbquant(reader)?;
                self.set_qscale((self.qscale as i32 + dq as i32).clamp(1, 31) as u8);
            }
            if !self.seq.progressive {
                if cbp != 0 {
                    rec.field_dct = reader.read_bit()? != 0;
                }
                if b_mode != BMbMode::Direct && reader.read_bit()? != 0 {
                    interlaced_mv = true;
                    if matches!(b_mode, BMbMode::Forward | BMbMode::Interpolate) {
                        rec.field_select[0][0] = reader.read_bit()? != 0;
                        rec.field_select[0][1] = reader.read_bit()? != 0;
                    }
                    if matches!(b_mode, BMbMode::Backward | BMbMode::Interpolate) {
                        rec.field_select[1][0] = reader.read_bit()? != 0;
                        rec.field_select[1][1] = reader.read_bit()? != 0;
                    }
                }
            }

            if b_mode != BMbMode::Direct && !interlaced_mv {
                if matches!(b_mode, BMbMode::Forward | BMbMode::Interpolate) {
                    let mx =
                        self.decode_motion(reader, self.b_last_mv[0][0].x, self.pic.f_code)?;
                    let my =
                        self.decode_motion(reader, self.b_last_mv[0][0].y, self.pic.f_code)?;
                    let mv = MotionVector { x: mx, y: my };
                    self.b_last_mv[0] = [mv; 2];
                    rec.mvs = [mv; 4];
                }
                if matches!(b_mode, BMbMode::Backward | BMbMode::Interpolate) {
                    let mx =
                        self.decode_motion(reader, self.b_last_mv[1][0].x, self.pic.b_code)?;
                    let my =
                        self.decode_motion(reader, self.b_last_mv[1][0].y, self.pic.b_code)?;
                    let mv = MotionVector { x: mx, y: my };
                    self.b_last_mv[1] = [mv; 2];
                    rec.mvs_backward = [mv; 4];
                }
            } else if b_mode != BMbMode::Direct {
                // 场 MV: 每个方向两条, 预测器的垂直分量按场距离折半存储
                if matches!(b_mode, BMbMode::Forward | BMbMode::Interpolate) {
                    for i in 0..2 {
                        let mx =
                            self.decode_motion(reader, self.b_last_mv[0][i].x, self.pic.f_code)?;
                        let my = self
                            .decode_motion(reader, self.b_last_mv[0][i].y / 2, self.pic.f_code)?;
                        self.b_last_mv[0][i] = MotionVector { x: mx, y: my * 2 };
                        rec.mvs[i] = MotionVector { x: mx, y: my };
                    }
                }
                if matches!(b_mode, BMbMode::Backward | BMbMode::Interpolate) {
                    for i in 0..2 {
                        let mx =
                            self.decode_motion(reader, self.b_last_mv[1][i].x, self.pic.b_code)?;
                        let my = self
                            .decode_motion(reader, self.b_last_mv[1][i].y / 2, self.pic.b_code)?;
                        self.b_last_mv[1][i] = MotionVector { x: mx, y: my * 2 };
                        rec.mvs_backward[i] = MotionVector { x: mx, y: my };
                    }
                }
            }
        }

        if b_mode == BMbMode::Direct {
            let delta = if direct_skip {
                MotionVector::default()
            } else {
                let x = self.decode_motion(reader, 0, 1)?;
                let y = self.decode_motion(reader, 0, 1)?;
                MotionVector { x, y }
            };
            self.set_direct_mv(delta);
            rec.mvs = self.b_mvs_forward;
            rec.mvs_backward = self.b_mvs_backward;
        }
        rec.b_mode = Some(b_mode);
        rec.mb_type = MbType::Inter;
        self.qscale_table[xy] = self.qscale;
        rec.cbp = cbp as u8;

        let mut cbp = cbp;
        for i in 0..6 {
            let mut blk = [0i16; 64];
            self.decode_block(reader, &mut blk, i, cbp & 32 != 0, false, false, false)?;
            rec.blocks[i] = blk;
            cbp += cbp;
        }
        self.mbs[xy] = rec;
        self.mb_end(reader)
    }

    /// 宏块尾部的切片边界探测
    fn mb_end(&mut self, reader: &mut BitReader) -> MeiResult<SliceState> {
        let next = self.next_resync_mb(reader);
        if next == 0 {
            return Ok(SliceState::Ok);
        }
        let pos = (self.mb_y * self.mb_width + self.mb_x + 1) as i32;
        if pos > next && self.strict {
            error!("resync 宏块号 {} 落在已解码区域 {} 之前", next, pos);
            return Err(MeiError::InvalidData("resync 宏块号回退".into()));
        }
        if pos >= next {
            return Ok(SliceState::End);
        }

        if self.pic.picture_type == PictureType::B {
            let xy = self.mb_y * self.mb_width + self.mb_x;
            let delta = if self.mb_x + 1 == self.mb_width { 2 } else { 1 };
            let await_row = if self.mb_x + delta >= self.mb_width {
                (self.mb_y + 1).min(self.mb_height - 1)
            } else {
                self.mb_y
            };
            self.ref_progress.wait_for(await_row as i32);
            if xy + delta < self.ref_mbskip.len() && self.ref_mbskip[xy + delta] != 0 {
                return Ok(SliceState::Ok);
            }
        }
        Ok(SliceState::End)
    }
}
