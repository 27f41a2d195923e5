//! 8x8 块级 DCT 系数解码
//!
//! Intra 的 DC 走独立的 DC size VLC (或并入首个游程符号), AC 游程符号
//! 带三级 escape: 第一级扩大级别, 第二级扩大游程, 第三级为定长原始值.
//! 数据分区帧的 DC 在分区 A 已解出, 此处从 DC 平面取回.

use log::error;
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::tables::{ALTERNATE_HORIZONTAL_SCAN, ALTERNATE_VERTICAL_SCAN, ZIGZAG_SCAN};
use super::types::PredDir;
use super::vlc::{self, RlSymbol, RlTable};

impl Mpeg4Decoder {
    /// 解码 intra DC 差分并叠加预测, 返回 (量化域 DC, 预测方向)
    pub(super) fn decode_dc(
        &mut self,
        reader: &mut BitReader,
        n: usize,
    ) -> MeiResult<(i32, PredDir)> {
        let code = vlc::decode_dc_size(reader, n < 4)?;
        let level = if code == 0 {
            0
        } else {
            let level = if &self.codec_tag == b"3IV1" {
                // 3ivx 的 DC 用符号位前置的原码而非补码偏移
                if code == 1 {
                    2 * reader.read_bit()? as i32 - 1
                } else if reader.read_bit()? != 0 {
                    reader.read_bits(code as u32 - 1)? as i32 + (1 << (code - 1))
                } else {
                    -(reader.read_bits(code as u32 - 1)? as i32) - (1 << (code - 1))
                }
            } else {
                reader.read_xbits(code as u32)?
            };
            if code > 8 && reader.read_bit()? == 0 && self.strict {
                error!("DC marker 位缺失");
                return Err(MeiError::InvalidData("DC marker 位缺失".into()));
            }
            level
        };
        let (pred, dir) = self.pred_dc(n);
        let dc = self.get_level_dc(n, pred, level)?;
        Ok((dc, dir))
    }

    /// 解码块 n 的 DCT 系数, 返回最后一个非零系数的扫描位置
    /// (-1 表示全零块)
    #[allow(clippy::too_many_arguments)]
    pub(super) fn decode_block(
        &mut self,
        reader: &mut BitReader,
        block: &mut [i16; 64],
        n: usize,
        coded: bool,
        intra: bool,
        use_intra_dc_vlc: bool,
        ac_pred: bool,
    ) -> MeiResult<i32> {
        let mut i: i32;
        let mut dir = PredDir::Left;
        let mut pred = 0i32;

        if intra {
            if use_intra_dc_vlc {
                let level = if self.pic.partitioned {
                    // DC 在分区 A 解出, 平面里存的是反量化后的值
                    let scale = if n < 4 {
                        self.y_dc_scale as i32
                    } else {
                        self.c_dc_scale as i32
                    };
                    let raw = self.pred.dc_at(n, self.mb_x, self.mb_y);
                    let mask = self.pred_dir_table[self.mb_y * self.mb_width + self.mb_x];
                    dir = if ((mask as u32) << n) & 32 != 0 {
                        PredDir::Top
                    } else {
                        PredDir::Left
                    };
                    (raw + (scale >> 1)) / scale
                } else {
                    let (dc, d) = self.decode_dc(reader, n)?;
                    dir = d;
                    dc
                };
                block[0] = level as i16;
                i = 0;
            } else {
                // DC 作为第一个游程符号编码, 量化留到块尾
                i = -1;
                let (p, d) = self.pred_dc(n);
                pred = p;
                dir = d;
            }
        } else {
            i = -1;
            if !coded {
                return Ok(-1);
            }
        }

        if coded {
            let (rl, qmul, qadd): (&RlTable, i32, i32) = if intra {
                (vlc::intra_rl(), 1, 0)
            } else if self.seq.mpeg_quant {
                (vlc::inter_rl(), 1, 0)
            } else {
                let q = self.qscale as i32;
                (vlc::inter_rl(), q << 1, (q - 1) | 1)
            };
            let scan: &[u8; 64] = if intra && ac_pred {
                match dir {
                    PredDir::Left => &ALTERNATE_VERTICAL_SCAN,
                    PredDir::Top => &ALTERNATE_HORIZONTAL_SCAN,
                }
            } else if self.pic.alternate_scan {
                &ALTERNATE_VERTICAL_SCAN
            } else {
                &ZIGZAG_SCAN
            };
            // RVLC 只出现在数据分区帧里
            let rvlc = self.seq.rvlc && self.pic.partitioned;
            let is_3iv1 = &self.codec_tag == b"3IV1";

            loop {
                let level;
                let last;
                match rl.decode_symbol(reader)? {
                    RlSymbol::Coeff { last: l, run, level: lv } => {
                        i += run as i32 + 1;
                        let sign = -(reader.read_bit()? as i32);
                        level = ((lv as i32 * qmul + qadd) ^ sign) - sign;
                        last = l;
                    }
                    RlSymbol::Escape if rvlc => {
                        if reader.read_bit()? == 0 {
                            error!("RVLC escape 缺少第 1 个 marker");
                            return Err(MeiError::InvalidData("RVLC escape marker".into()));
                        }
                        last = reader.read_bit()? != 0;
                        let run = reader.read_bits(6)? as i32;
                        if reader.read_bit()? == 0 {
                            error!("RVLC escape 缺少第 2 个 marker");
                            return Err(MeiError::InvalidData("RVLC escape marker".into()));
                        }
                        let lv = reader.read_bits(11)? as i32;
                        if reader.read_bits(5)? != 0x10 {
                            error!("RVLC escape 缺少反向标记");
                            return Err(MeiError::InvalidData("RVLC escape 反向标记".into()));
                        }
                        let sign = -(reader.read_bit()? as i32);
                        level = ((lv * qmul + qadd) ^ sign) - sign;
                        i += run + 1;
                    }
                    RlSymbol::Escape => {
                        // 后两位选择 escape 级别; 3ivx 把这两位按位取反
                        let flip = if is_3iv1 { 3 } else { 0 };
                        let sel = reader.peek_bits(2)? ^ flip;
                        if sel & 2 == 0 {
                            // 第一级: 级别加上同 (last, run) 的表内最大级别
                            reader.skip_bits(1)?;
                            let RlSymbol::Coeff { last: l, run, level: lv } =
                                rl.decode_symbol(reader)?
                            else {
                                return Err(MeiError::InvalidData(
                                    "escape 内不允许嵌套 escape".into(),
                                ));
                            };
                            i += run as i32 + 1;
                            let base = lv as i32 + rl.max_level(l, run) as i32;
                            let sign = -(reader.read_bit()? as i32);
                            level = ((base * qmul + qadd) ^ sign) - sign;
                            last = l;
                        } else if sel == 2 {
                            // 第二级: 游程加上同 (last, level) 的表内最大游程
                            reader.skip_bits(2)?;
                            let RlSymbol::Coeff { last: l, run, level: lv } =
                                rl.decode_symbol(reader)?
                            else {
                                return Err(MeiError::InvalidData(
                                    "escape 内不允许嵌套 escape".into(),
                                ));
                            };
                            i += run as i32 + rl.max_run(l, lv) as i32 + 2;
                            let sign = -(reader.read_bit()? as i32);
                            level = ((lv as i32 * qmul + qadd) ^ sign) - sign;
                            last = l;
                        } else {
                            // 第三级: 定长 last/run/level
                            reader.skip_bits(2)?;
                            last = reader.read_bit()? != 0;
                            let run = reader.read_bits(6)? as i32;
                            let lv = if is_3iv1 {
                                reader.read_bits_signed(12)?
                            } else {
                                if reader.read_bit()? == 0 {
                                    error!("escape 3 缺少第 1 个 marker");
                                    return Err(MeiError::InvalidData(
                                        "escape 3 marker".into(),
                                    ));
                                }
                                let v = reader.read_bits_signed(12)?;
                                if reader.read_bit()? == 0 {
                                    error!("escape 3 缺少第 2 个 marker");
                                    return Err(MeiError::InvalidData(
                                        "escape 3 marker".into(),
                                    ));
                                }
                                v
                            };
                            let mut v = if lv > 0 { lv * qmul + qadd } else { lv * qmul - qadd };
                            if (v + 2048) as u32 > 4095 {
                                if self.strict && !(-2560..=2560).contains(&v) {
                                    error!("escape 3 级别溢出 (qp={})", self.qscale);
                                    return Err(MeiError::InvalidData(
                                        "escape 3 级别溢出".into(),
                                    ));
                                }
                                v = if v < 0 { -2048 } else { 2047 };
                            }
                            level = v;
                            i += run + 1;
                        }
                    }
                }

                let mut pos = i;
                if last {
                    pos += 192;
                }
                if pos > 62 {
                    pos -= 192;
                    if pos & !63 != 0 {
                        error!("AC 纹理在 ({}, {}) 处损坏", self.mb_x, self.mb_y);
                        return Err(MeiError::InvalidData("AC 纹理损坏".into()));
                    }
                    i = pos;
                    block[self.idct_permutation[scan[pos as usize] as usize] as usize] =
                        level as i16;
                    break;
                }
                i = pos;
                block[self.idct_permutation[scan[pos as usize] as usize] as usize] = level as i16;
            }
        }

        if intra {
            if !use_intra_dc_vlc {
                block[0] = self.get_level_dc(n, pred, block[0] as i32)? as i16;
                if i == -1 {
                    i = 0;
                }
            }
            self.pred_ac(block, n, dir, ac_pred);
            if ac_pred {
                i = 63;
            }
        }
        Ok(i)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Mpeg4Decoder;
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

    fn decoder() -> Mpeg4Decoder {
        let mut d = Mpeg4Decoder::new();
        d.set_dimensions(64, 48);
        d.set_qscale(4);
        d
    }

    #[test]
    fn test_inter_block_two_coefficients() {
        let mut d = decoder();
        // (run 0, level 1) 正号 + (last, run 0, level 1) 负号
        let data = bits_to_bytes("10 0 0111 1");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        let last = d
            .decode_block(&mut r, &mut block, 0, true, false, false, false)
            .unwrap();
        // qscale=4: qmul=8, qadd=3
        assert_eq!(block[0], 11);
        assert_eq!(block[1], -11);
        assert_eq!(last, 1);
    }

    #[test]
    fn test_inter_block_not_coded() {
        let mut d = decoder();
        let mut r = BitReader::new(&[]);
        let mut block = [0i16; 64];
        let last = d
            .decode_block(&mut r, &mut block, 0, false, false, false, false)
            .unwrap();
        assert_eq!(last, -1);
        assert_eq!(block, [0i16; 64]);
    }

    #[test]
    fn test_inter_block_third_escape() {
        let mut d = decoder();
        // escape "0000011" + "11" + last + run=2 + marker + level=60 + marker
        let data = bits_to_bytes("0000011 11 1 000010 1 000000111100 1");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        let last = d
            .decode_block(&mut r, &mut block, 0, true, false, false, false)
            .unwrap();
        assert_eq!(last, 2);
        // zigzag[2] = 8, 60*8+3 = 483
        assert_eq!(block[8], 483);
    }

    #[test]
    fn test_third_escape_missing_marker_rejected() {
        let mut d = decoder();
        let data = bits_to_bytes("0000011 11 1 000010 0 000000111100 1");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        assert!(
            d.decode_block(&mut r, &mut block, 0, true, false, false, false)
                .is_err()
        );
    }

    #[test]
    fn test_third_escape_big_level_clamped() {
        let mut d = decoder();
        // level = 300: 300*8+3 = 2403 > 2047, 非严格模式夹取
        let data = bits_to_bytes("0000011 11 1 000000 1 000100101100 1");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        d.decode_block(&mut r, &mut block, 0, true, false, false, false)
            .unwrap();
        assert_eq!(block[0], 2047);

        // 严格模式下 2403 <= 2560 仍然夹取, 不报错
        let mut d = decoder();
        d.strict = true;
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        d.decode_block(&mut r, &mut block, 0, true, false, false, false)
            .unwrap();
        assert_eq!(block[0], 2047);
    }

    #[test]
    fn test_run_overflow_is_corrupt() {
        let mut d = decoder();
        // 三个 run=26 的符号把扫描位置推过 63
        let data = bits_to_bytes("000001010111 0 000001010111 0 000001010111 0");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        assert!(
            d.decode_block(&mut r, &mut block, 0, true, false, false, false)
                .is_err()
        );
    }

    #[test]
    fn test_intra_block_dc_as_first_coefficient() {
        let mut d = decoder();
        // use_intra_dc_vlc=false: DC 并入首个游程符号
        let data = bits_to_bytes("10 0 0111 0");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        let last = d
            .decode_block(&mut r, &mut block, 0, true, true, false, false)
            .unwrap();
        // pred=1024, y_dc_scale=8: (128 + 1) 量化域
        assert_eq!(block[0], 129);
        assert_eq!(block[1], 1);
        assert_eq!(last, 1);
        // 平面里存反量化后的 DC
        assert_eq!(d.pred.dc_at(0, 0, 0), 129 * 8);
    }

    #[test]
    fn test_intra_ac_pred_forces_full_last_index() {
        let mut d = decoder();
        d.first_slice_line = false;
        let data = bits_to_bytes("10 0 0111 0");
        let mut r = BitReader::new(&data);
        let mut block = [0i16; 64];
        let last = d
            .decode_block(&mut r, &mut block, 0, true, true, false, true)
            .unwrap();
        assert_eq!(last, 63);
    }
}
