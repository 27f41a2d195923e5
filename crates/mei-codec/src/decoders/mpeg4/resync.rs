//! resync marker 探测与 video packet 头部
//!
//! resync marker 是字节对齐的 16+ 个零位后跟一个 1, 零的个数随
//! 帧类型与 f_code 变化. 出错后从下一个 marker 恢复解码.

use log::{error, warn};
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::header::check_marker;
use super::types::{PictureType, SliceState, SpriteMode, VolShape};

/// marker 前缀 (含首个 1) 的位数
pub(super) fn video_packet_prefix_length(
    picture_type: PictureType,
    f_code: u8,
    b_code: u8,
) -> u32 {
    match picture_type {
        PictureType::I => 16,
        PictureType::B => (f_code.max(b_code).max(2) as u32) + 15,
        _ => (f_code as u32) + 15,
    }
}

/// 宏块号字段的位宽
pub(super) fn mb_num_bits(total: usize) -> u32 {
    if total <= 2 {
        1
    } else {
        (total as u32 - 1).ilog2() + 1
    }
}

fn picture_type_code(t: PictureType) -> u32 {
    match t {
        PictureType::I => 1,
        PictureType::P => 2,
        PictureType::B => 3,
        PictureType::S => 4,
    }
}

impl Mpeg4Decoder {
    /// 探测紧随其后的 resync marker 或码流结尾
    ///
    /// 返回 0 表示没有 marker; 正数是 marker 携带的宏块号
    /// (码流结尾按总宏块数返回); -1 表示 marker 受损.
    pub(super) fn next_resync_mb(&self, reader: &mut BitReader) -> i32 {
        let mb_total = self.mb_width * self.mb_height;
        let mut bits_count = reader.bits_read();
        let size_in_bits = reader.data().len() * 8;
        let mut v = match reader.peek_bits(16) {
            Ok(v) => v,
            Err(_) => return 0,
        };

        if self.bugs.contains(super::types::BugFlags::NO_PADDING) && !self.seq.resync_marker {
            return 0;
        }

        // 部分编码器在 marker 前塞入形如 0..01 的短填充
        let pt = picture_type_code(self.pic.picture_type);
        while v <= 0xFF {
            if self.pic.picture_type == PictureType::B
                || (v >> (8 - pt)) != 1
                || self.pic.partitioned
            {
                break;
            }
            if reader.skip_bits(8 + pt).is_err() {
                return 0;
            }
            bits_count += (8 + pt) as usize;
            v = match reader.peek_bits(16) {
                Ok(v) => v,
                Err(_) => return 0,
            };
        }

        if bits_count + 8 >= size_in_bits {
            // 结尾的字节对齐填充: 一个 0 加若干 1
            let v = (v >> 8) | (0x7F >> (7 - (bits_count & 7)));
            if v == 0x7F {
                return mb_total as i32;
            }
        } else {
            const RESYNC_PREFIX: [u32; 8] = [
                0x7F00, 0x7E00, 0x7C00, 0x7800, 0x7000, 0x6000, 0x4000, 0x0000,
            ];
            if v == RESYNC_PREFIX[bits_count & 7] {
                let saved = reader.bits_read();
                let mut probe = || -> MeiResult<(u32, i32)> {
                    reader.skip_bits(1)?;
                    reader.align_to_byte();
                    let len = reader.read_unary(1)?.min(32);
                    let num = reader.read_bits(mb_num_bits(mb_total))? as i32;
                    let num = if num == 0
                        || num as usize > mb_total
                        || reader.bits_read() + 6 > size_in_bits
                    {
                        -1
                    } else {
                        num
                    };
                    Ok((len, num))
                };
                let result = probe();
                if reader.set_bit_position(saved).is_err() {
                    return 0;
                }
                if let Ok((len, num)) = result {
                    let prefix = video_packet_prefix_length(
                        self.pic.picture_type,
                        self.pic.f_code,
                        self.pic.b_code,
                    );
                    if len >= prefix {
                        return num;
                    }
                }
            }
        }
        0
    }

    /// 解码 video packet 头部, 更新宏块坐标与 qscale
    pub(super) fn decode_video_packet_header(
        &mut self,
        reader: &mut BitReader,
    ) -> MeiResult<()> {
        let mb_total = self.mb_width * self.mb_height;
        let size_in_bits = reader.data().len() * 8;

        if reader.bits_read() + 20 > size_in_bits {
            return Err(MeiError::InvalidData("video packet 空间不足".into()));
        }

        let len = reader.read_unary(1)?.min(32);
        let prefix =
            video_packet_prefix_length(self.pic.picture_type, self.pic.f_code, self.pic.b_code);
        if len != prefix {
            error!("resync marker 长度与 f_code 不符");
            return Err(MeiError::InvalidData("resync marker 长度错误".into()));
        }

        let mut header_extension = false;
        if self.seq.shape != VolShape::Rectangular {
            header_extension = reader.read_bit()? != 0;
        }

        let mb_num = reader.read_bits(mb_num_bits(mb_total))? as usize;
        if mb_num >= mb_total || mb_num == 0 {
            error!("video packet 中的宏块号非法 ({} / {})", mb_num, mb_total);
            return Err(MeiError::InvalidData("video packet 宏块号非法".into()));
        }
        self.mb_x = mb_num % self.mb_width;
        self.mb_y = mb_num / self.mb_width;

        if self.seq.shape != VolShape::BinaryOnly {
            let qscale = reader.read_bits(self.seq.quant_precision as u32)?;
            if qscale != 0 {
                self.set_qscale(qscale as u8);
            }
        }

        if self.seq.shape == VolShape::Rectangular {
            header_extension = reader.read_bit()? != 0;
        }

        if header_extension {
            // modulo_time_base
            while reader.read_bit()? != 0 {}
            check_marker(reader, "video packet 的 time_increment 之前")?;
            reader.skip_bits(self.seq.time_increment_bits as u32)?;
            check_marker(reader, "video packet 的 vop_coding_type 之前")?;
            reader.skip_bits(2)?;

            if self.seq.shape != VolShape::BinaryOnly {
                reader.skip_bits(3)?;
                if self.pic.picture_type == PictureType::S
                    && self.seq.sprite == SpriteMode::Gmc
                {
                    self.decode_sprite_trajectory(reader)?;
                    warn!("video packet 携带 sprite 轨迹, 路径少有覆盖");
                }
                if self.pic.picture_type != PictureType::I {
                    let f_code = reader.read_bits(3)?;
                    if f_code == 0 {
                        error!("video packet 头部受损 (f_code=0)");
                    }
                }
                if self.pic.picture_type == PictureType::B {
                    let b_code = reader.read_bits(3)?;
                    if b_code == 0 {
                        error!("video packet 头部受损 (b_code=0)");
                    }
                }
            }
        }
        if self.seq.new_pred {
            let len = (self.seq.time_increment_bits as u32 + 3).min(15);
            reader.skip_bits(len)?;
            if reader.read_bit()? != 0 {
                reader.skip_bits(len)?;
            }
            check_marker(reader, "new_pred 之后")?;
        }
        Ok(())
    }

    /// 出错后向前扫描下一个 resync marker 并重建解码状态
    ///
    /// 成功时宏块坐标已指向新 slice 的起点; 找不到 marker 返回错误.
    pub(super) fn resync(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        reader.align_to_byte();
        let size_in_bits = reader.data().len() * 8;

        while reader.bits_read() + 39 < size_in_bits {
            if reader.peek_bits(16).unwrap_or(1) == 0 {
                let saved = reader.bits_read();
                if self.decode_video_packet_header(reader).is_ok() {
                    self.resync_mb_x = self.mb_x;
                    self.resync_mb_y = self.mb_y;
                    self.first_slice_line = true;
                    self.pred.reset();
                    self.b_last_mv = [[Default::default(); 2]; 2];
                    return Ok(());
                }
                reader.set_bit_position(saved)?;
            }
            reader.skip_bits(8)?;
        }
        Err(MeiError::InvalidData("找不到可用的 resync marker".into()))
    }

    /// resync 前/后跳过残留的 slice, 把其中宏块计为出错
    pub(super) fn mark_error_range(&mut self, start: usize, end: usize) -> usize {
        let mb_total = self.mb_width * self.mb_height;
        let end = end.min(mb_total);
        for xy in start..end {
            self.mbs[xy].in_error = true;
        }
        end.saturating_sub(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_video_packet_header_accepted() {
        // I 帧 176x144: 16 个零 + 1, 宏块号 7 位, qscale 5 位, hec=0
        let mut bits = String::new();
        bits.push_str(&"0".repeat(16));
        bits.push('1');
        bits.push_str("0000101"); // mb_num = 5
        bits.push_str("01000"); // qscale = 8
        bits.push('0'); // hec
        let data = bits_to_bytes(&bits);
        let mut d = Mpeg4Decoder::new();
        d.set_dimensions(176, 144);
        let mut reader = BitReader::new(&data);
        d.decode_video_packet_header(&mut reader).unwrap();
        assert_eq!(d.mb_x, 5);
        assert_eq!(d.mb_y, 0);
        assert_eq!(d.qscale, 8);
    }

    #[test]
    fn test_video_packet_wrong_prefix_rejected() {
        // 前缀 17 个零和 I 帧的 16 不符, 后续字段再合法也要拒绝
        let mut bits = String::new();
        bits.push_str(&"0".repeat(17));
        bits.push('1');
        bits.push_str("0000101");
        bits.push_str("01000");
        bits.push('0');
        let data = bits_to_bytes(&bits);
        let mut d = Mpeg4Decoder::new();
        d.set_dimensions(176, 144);
        let mut reader = BitReader::new(&data);
        assert!(d.decode_video_packet_header(&mut reader).is_err());
    }

    #[test]
    fn test_prefix_length_per_picture_type() {
        assert_eq!(video_packet_prefix_length(PictureType::I, 3, 1), 16);
        assert_eq!(video_packet_prefix_length(PictureType::P, 3, 1), 18);
        assert_eq!(video_packet_prefix_length(PictureType::S, 1, 1), 16);
        assert_eq!(video_packet_prefix_length(PictureType::B, 1, 1), 17);
        assert_eq!(video_packet_prefix_length(PictureType::B, 4, 3), 19);
    }

    #[test]
    fn test_mb_num_bits_widths() {
        assert_eq!(mb_num_bits(2), 1);
        assert_eq!(mb_num_bits(99), 7);
        assert_eq!(mb_num_bits(396), 9);
        assert_eq!(mb_num_bits(1620), 11);
    }
}
