//! VOP 头部解析与时间基推导
//!
//! 产生每帧的 `PictureConfig`; B 帧的 direct 模式时间比 (pb_time/pp_time)
//! 也在此处推导. 时间增量位宽错误时带自校正启发式.

use log::{debug, error, warn};
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::header::check_marker;
use super::tables::DC_THRESHOLD_TABLE;
use super::types::{PictureType, SkipReason, SpriteMode, VolShape};

/// VOP 头部解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum VopOutcome {
    Proceed,
    Skip(SkipReason),
}

/// 向最近整数取整的除法
pub(super) fn rounded_div(a: i64, b: i64) -> i64 {
    if a > 0 { (a + b / 2) / b } else { (a - b / 2) / b }
}

impl Mpeg4Decoder {
    /// 解析 VOP 头部
    pub(super) fn decode_vop_header(&mut self, reader: &mut BitReader) -> MeiResult<VopOutcome> {
        self.pic.picture_type = match reader.read_bits(2)? {
            0 => PictureType::I,
            1 => PictureType::P,
            2 => PictureType::B,
            _ => PictureType::S,
        };
        let pict_type = self.pic.picture_type;

        if pict_type == PictureType::B && self.seq.low_delay && !self.seq.vol_control_parameters {
            error!("low_delay 标志与 B 帧冲突, 清除");
            self.seq.low_delay = false;
        }

        self.pic.partitioned = self.seq.data_partitioned && pict_type != PictureType::B;

        let mut time_incr = 0i64;
        while reader.read_bit()? != 0 {
            time_incr += 1;
        }
        check_marker(reader, "time_increment 之前")?;

        self.heal_time_increment_bits(reader, pict_type)?;
        let time_increment = reader.read_bits(self.seq.time_increment_bits as u32)? as i64;
        let resolution = self.seq.time_increment_resolution as i64;

        if pict_type != PictureType::B {
            self.last_time_base = self.time_base;
            self.time_base += time_incr;
            self.time = self.time_base * resolution + time_increment;
            if self.bugs.contains(super::types::BugFlags::UMP4) && self.time < self.last_non_b_time
            {
                warn!("时间戳倒退, 按 UMP4 缺陷补偿");
                self.time_base += 1;
                self.time += resolution;
            }
            self.pp_time = self.time - self.last_non_b_time;
            self.last_non_b_time = self.time;
        } else {
            self.time = (self.last_time_base + time_incr) * resolution + time_increment;
            self.pb_time = self.pp_time - (self.last_non_b_time - self.time);
            if self.pp_time <= self.pb_time
                || self.pp_time <= self.pp_time - self.pb_time
                || self.pp_time <= 0
            {
                // B 帧时间参考倒置, 多半是 seek 后缺少参考帧
                debug!("B 帧时间参考非法, 跳过该帧");
                return Ok(VopOutcome::Skip(SkipReason::BTimingInversion));
            }
            if !self.seq.progressive {
                if self.t_frame == 0 {
                    self.t_frame = self.pb_time;
                }
                if self.t_frame == 0 {
                    self.t_frame = 1;
                }
                self.pp_field_time = (rounded_div(self.last_non_b_time, self.t_frame)
                    - rounded_div(self.last_non_b_time - self.pp_time, self.t_frame))
                    * 2;
                self.pb_field_time = (rounded_div(self.time, self.t_frame)
                    - rounded_div(self.last_non_b_time - self.pp_time, self.t_frame))
                    * 2;
                if self.pp_field_time <= self.pb_field_time || self.pb_field_time <= 1 {
                    self.pb_field_time = 2;
                    self.pp_field_time = 4;
                    return Ok(VopOutcome::Skip(SkipReason::BTimingInversion));
                }
            }
        }

        self.pic.time = self.time;
        self.pic.pts = rounded_div(self.time, self.seq.fixed_vop_rate.max(1) as i64);

        check_marker(reader, "vop_coded 之前")?;
        if reader.read_bit()? != 1 {
            debug!("vop_coded == 0");
            return Ok(VopOutcome::Skip(SkipReason::NotCoded));
        }

        if self.seq.new_pred {
            self.decode_new_pred(reader)?;
        }

        if self.seq.shape != VolShape::BinaryOnly
            && (pict_type == PictureType::P
                || (pict_type == PictureType::S && self.seq.sprite == SpriteMode::Gmc))
        {
            self.pic.no_rounding = reader.read_bit()? == 1;
        } else {
            self.pic.no_rounding = false;
        }

        if self.seq.shape != VolShape::BinaryOnly {
            if self.seq.shape != VolShape::Rectangular {
                // 任意形状 VOP 的几何字段
                if !(self.seq.sprite == SpriteMode::Static && pict_type == PictureType::I) {
                    for what in ["vop 宽度", "vop 高度", "水平参考", "垂直参考"] {
                        reader.skip_bits(13)?;
                        check_marker(reader, what)?;
                    }
                }
                reader.read_bit()?; // change_conv_ratio_disable
                if reader.read_bit()? == 1 {
                    reader.read_bit()?; // vop_constant_alpha_value
                }
            }

            reader.skip_bits(self.seq.cplx_estimation_trash_i as u32)?;
            if pict_type != PictureType::I {
                reader.skip_bits(self.seq.cplx_estimation_trash_p as u32)?;
            }
            if pict_type == PictureType::B {
                reader.skip_bits(self.seq.cplx_estimation_trash_b as u32)?;
            }

            if reader.bits_left() < 3 {
                return Err(MeiError::InvalidData("VOP 头部被截断".into()));
            }
            self.pic.intra_dc_threshold = DC_THRESHOLD_TABLE[reader.read_bits(3)? as usize];

            if !self.seq.progressive {
                self.pic.top_field_first = reader.read_bit()? == 1;
                self.pic.alternate_scan = reader.read_bit()? == 1;
            } else {
                self.pic.alternate_scan = false;
            }
        }

        if pict_type == PictureType::S {
            if self.seq.sprite != SpriteMode::None {
                self.decode_sprite_trajectory(reader)?;
                if self.seq.sprite_brightness_change {
                    error!("sprite 亮度变化不支持");
                }
                if self.seq.sprite == SpriteMode::Static {
                    error!("静态 sprite 不支持");
                }
            } else {
                self.gmc.clear();
            }
        }

        self.pic.f_code = 1;
        self.pic.b_code = 1;
        if self.seq.shape != VolShape::BinaryOnly {
            let qscale = reader.read_bits(self.seq.quant_precision as u32)? as u8;
            if qscale == 0 {
                return Err(MeiError::InvalidData(
                    "头部损坏或非 MPEG-4 头部 (qscale=0)".into(),
                ));
            }
            self.pic.qscale = qscale;
            self.qscale = qscale;

            if pict_type != PictureType::I {
                let f_code = reader.read_bits(3)? as u8;
                if f_code == 0 {
                    return Err(MeiError::InvalidData(
                        "头部损坏或非 MPEG-4 头部 (f_code=0)".into(),
                    ));
                }
                self.pic.f_code = f_code;
            }
            if pict_type == PictureType::B {
                let b_code = reader.read_bits(3)? as u8;
                if b_code == 0 {
                    return Err(MeiError::InvalidData(
                        "头部损坏或非 MPEG-4 头部 (b_code=0)".into(),
                    ));
                }
                self.pic.b_code = b_code;
            }

            if !self.seq.scalability {
                if self.seq.shape != VolShape::Rectangular && pict_type != PictureType::I {
                    reader.read_bit()?; // vop_shape_coding_type
                }
            } else {
                if self.seq.enhancement_type && reader.read_bit()? == 1 {
                    error!("backward shape 载入不支持");
                }
                reader.skip_bits(2)?; // ref_select_code
            }
        }

        if self.seq.vo_type == 0
            && !self.seq.vol_control_parameters
            && self.encoder.divx_version == -1
            && self.picture_number == 0
        {
            warn!("流疑似 divx4/旧 xvid/opendivx 编码, 强制 low_delay");
            self.seq.low_delay = true;
        }
        self.picture_number += 1;

        debug!(
            "VOP: {:?}, qscale={}, f_code={}, b_code={}, time={}, partitioned={}",
            pict_type,
            self.pic.qscale,
            self.pic.f_code,
            self.pic.b_code,
            self.time,
            self.pic.partitioned,
        );
        Ok(VopOutcome::Proceed)
    }

    /// time_increment_bits 与码流不符时, 用帧头已知的位模式猜测真实位宽
    fn heal_time_increment_bits(
        &mut self,
        reader: &mut BitReader,
        pict_type: PictureType,
    ) -> MeiResult<()> {
        let bits = self.seq.time_increment_bits;
        if bits != 0 && (reader.peek_bits(bits as u32 + 1)? & 1) == 1 {
            return Ok(());
        }
        warn!(
            "time_increment_bits {} 与码流不符, 多半缺失 VOL 头部",
            bits
        );
        let mut guessed = 1u8;
        while guessed < 16 {
            let hit = if pict_type == PictureType::P
                || (pict_type == PictureType::S && self.seq.sprite == SpriteMode::Gmc)
            {
                (reader.peek_bits(guessed as u32 + 6)? & 0x37) == 0x30
            } else {
                (reader.peek_bits(guessed as u32 + 5)? & 0x1F) == 0x18
            };
            if hit {
                break;
            }
            guessed += 1;
        }
        warn!("猜测 time_increment_bits = {}", guessed);
        self.seq.time_increment_bits = guessed;
        Ok(())
    }

    /// NEWPRED 模式的 vop_id 字段 (仅跳过)
    fn decode_new_pred(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        let len = (self.seq.time_increment_bits + 3).min(15) as u32;
        reader.skip_bits(len)?; // vop_id
        if reader.read_bit()? == 1 {
            reader.skip_bits(len)?; // vop_id_for_prediction
        }
        check_marker(reader, "vop_id 之后")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Mpeg4Decoder;
    use super::super::types::{PictureType, SkipReason};
    use super::*;
    use mei_core::BitReader;

    fn bits_to_bytes(bits: &str) -> Vec<u8> {
        let mut s: String = bits.chars().filter(|c| !c.is_whitespace()).collect();
        while s.len() % 8 != 0 {
            s.push('0');
        }
        s.as_bytes()
            .chunks(8)
            .map(|c| u8::from_str_radix(std::str::from_utf8(c).unwrap(), 2).unwrap())
            .collect()
    }

    fn decoder_with_vol() -> Mpeg4Decoder {
        let mut d = Mpeg4Decoder::new();
        d.seq.time_increment_resolution = 25;
        d.seq.time_increment_bits = 5;
        d.seq.quant_precision = 5;
        d.set_dimensions(64, 64);
        d.has_vol = true;
        d
    }

    /// I-VOP 头部: 类型 I, time_incr=0, increment=1, coded, dc_thr=0, qscale=4
    fn i_vop_bits() -> String {
        let mut bits = String::new();
        bits.push_str("00"); // I
        bits.push('0'); // modulo_time_base 结束
        bits.push('1'); // marker
        bits.push_str("00001"); // time_increment = 1
        bits.push('1'); // marker
        bits.push('1'); // vop_coded
        bits.push_str("000"); // intra_dc_vlc_thr
        bits.push_str("00100"); // qscale = 4
        bits
    }

    #[test]
    fn test_i_vop_header() {
        let data = bits_to_bytes(&i_vop_bits());
        let mut d = decoder_with_vol();
        let mut r = BitReader::new(&data);
        assert_eq!(d.decode_vop_header(&mut r).unwrap(), VopOutcome::Proceed);
        assert_eq!(d.pic.picture_type, PictureType::I);
        assert_eq!(d.pic.qscale, 4);
        assert_eq!(d.pic.intra_dc_threshold, 99);
        assert_eq!(d.time, 1);
        assert_eq!(d.picture_number, 1);
    }

    #[test]
    fn test_vop_not_coded() {
        let mut bits = String::new();
        bits.push_str("00");
        bits.push('0');
        bits.push('1');
        bits.push_str("00001");
        bits.push('1');
        bits.push('0'); // vop_coded = 0
        let data = bits_to_bytes(&bits);
        let mut d = decoder_with_vol();
        let mut r = BitReader::new(&data);
        assert_eq!(
            d.decode_vop_header(&mut r).unwrap(),
            VopOutcome::Skip(SkipReason::NotCoded)
        );
    }

    #[test]
    fn test_time_increment_bits_self_heal() {
        // VOL 信息错误 (声称 8 位), 码流实为 5 位增量:
        // 解析器按 I 帧的 marker+coded+阈值位形扫描并修正位宽
        let data = bits_to_bytes(&i_vop_bits());
        let mut d = decoder_with_vol();
        d.seq.time_increment_bits = 8;
        let mut r = BitReader::new(&data);
        assert_eq!(d.decode_vop_header(&mut r).unwrap(), VopOutcome::Proceed);
        assert_eq!(d.seq.time_increment_bits, 5);
        assert_eq!(d.time, 1);
        assert_eq!(d.pic.qscale, 4);
    }

    #[test]
    fn test_vop_zero_qscale_rejected() {
        let mut bits = i_vop_bits();
        // 末 5 位是 qscale, 置 0
        bits.truncate(bits.len() - 5);
        bits.push_str("00000");
        let data = bits_to_bytes(&bits);
        let mut d = decoder_with_vol();
        let mut r = BitReader::new(&data);
        assert!(d.decode_vop_header(&mut r).is_err());
    }

    #[test]
    fn test_p_vop_timing_advances() {
        // P-VOP: f_code=1, rounding=0
        let mut bits = String::new();
        bits.push_str("01"); // P
        bits.push('0');
        bits.push('1');
        bits.push_str("00011"); // time_increment = 3
        bits.push('1');
        bits.push('1'); // vop_coded
        bits.push('0'); // rounding
        bits.push_str("000"); // dc thr
        bits.push_str("00100"); // qscale
        bits.push_str("001"); // f_code
        let data = bits_to_bytes(&bits);
        let mut d = decoder_with_vol();
        d.last_non_b_time = 1;
        let mut r = BitReader::new(&data);
        assert_eq!(d.decode_vop_header(&mut r).unwrap(), VopOutcome::Proceed);
        assert_eq!(d.pic.picture_type, PictureType::P);
        assert_eq!(d.pic.f_code, 1);
        assert_eq!(d.time, 3);
        assert_eq!(d.pp_time, 2);
        assert_eq!(d.last_non_b_time, 3);
    }

    #[test]
    fn test_b_vop_timing_inversion_skipped() {
        let mut bits = String::new();
        bits.push_str("10"); // B
        bits.push('0');
        bits.push('1');
        bits.push_str("00001");
        bits.push('1');
        let data = bits_to_bytes(&bits);
        let mut d = decoder_with_vol();
        // 无前置参考帧: pp_time=0 导致倒置判定
        let mut r = BitReader::new(&data);
        assert_eq!(
            d.decode_vop_header(&mut r).unwrap(),
            VopOutcome::Skip(SkipReason::BTimingInversion)
        );
    }

    #[test]
    fn test_rounded_div() {
        assert_eq!(rounded_div(3, 2), 2);
        assert_eq!(rounded_div(-3, 2), -2);
        assert_eq!(rounded_div(10, 5), 2);
    }
}
