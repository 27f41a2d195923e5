//! 全局运动补偿 (GMC) 的 sprite 轨迹参数
//!
//! S-VOP 头部携带至多 3 个 warping point 的位移, 由此推导仿射参数
//! (offset/delta/shift). 溢出检测失败时参数整体清零并上报,
//! 避免未定义的整型回绕.

use log::error;
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::header::check_marker;
use super::tables::ceil_log2;
use super::types::BugFlags;
use super::vlc;

/// 推导出的 sprite 仿射参数; 下标 0 为亮度, 1 为色度
#[derive(Debug, Clone, Default)]
pub(super) struct GmcState {
    pub offset: [[i64; 2]; 2],
    pub delta: [[i64; 2]; 2],
    pub shift: [u32; 2],
    /// 化简后的有效 warping point 数
    pub real_points: u8,
}

impl GmcState {
    pub(super) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// 向最近整数取整的右移, 负数侧偏向负无穷
fn rshift(a: i64, b: u32) -> i64 {
    if a > 0 {
        (a + ((1i64 << b) >> 1)) >> b
    } else {
        (a + ((1i64 << b) >> 1) - 1) >> b
    }
}

fn rounded_div64(a: i64, b: i64) -> i64 {
    if (a > 0) == (b > 0) {
        (a + b / 2) / b
    } else {
        (a - b / 2) / b
    }
}

impl Mpeg4Decoder {
    /// 解析 sprite 轨迹位移并推导仿射参数
    pub(super) fn decode_sprite_trajectory(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        let mut d = [[0i32; 2]; 4];
        // DivX 5.00 build 413 在 x 与 y 之间漏写 marker
        let skip_x_marker =
            self.encoder.divx_version == 500 && self.encoder.divx_build == 413;

        for point in d.iter_mut().take(self.seq.num_sprite_warping_points as usize) {
            let len = vlc::decode_sprite_dmv_len(reader)?;
            if len > 0 {
                point[0] = reader.read_xbits(len as u32)?;
            }
            if !skip_x_marker {
                check_marker(reader, "sprite 轨迹 x")?;
            }
            let len = vlc::decode_sprite_dmv_len(reader)?;
            if len > 0 {
                point[1] = reader.read_xbits(len as u32)?;
            }
            check_marker(reader, "sprite 轨迹 y")?;
        }

        self.compute_sprite_params(&d)
    }

    /// 由 warping point 位移推导 offset/delta/shift
    pub(super) fn compute_sprite_params(&mut self, d: &[[i32; 2]; 4]) -> MeiResult<()> {
        let accuracy = self.seq.sprite_warping_accuracy as u32;
        let a = 2i64 << accuracy;
        let rho = 3 - accuracy;
        let r = 16 / a;
        let w = self.seq.width as i64;
        let h = self.seq.height as i64;
        if w <= 0 || h <= 0 {
            return Err(MeiError::InvalidData("sprite 需要合法的帧尺寸".into()));
        }

        let alpha = ceil_log2(w as i32) as u32;
        let beta = ceil_log2(h as i32) as u32;
        let w2 = 1i64 << alpha;
        let h2 = 1i64 << beta;

        // 参考点: (0,0), (w,0), (0,h); 第 4 点 GMC 不使用
        let vop_ref: [[i64; 2]; 3] = [[0, 0], [w, 0], [0, h]];
        let mut sprite_ref = [[0i64; 2]; 3];
        let divx_500_413 =
            self.encoder.divx_version == 500 && self.encoder.divx_build == 413;
        let mut acc = [0i64; 2];
        for (i, sr) in sprite_ref.iter_mut().enumerate() {
            acc[0] += d[i][0] as i64;
            acc[1] += d[i][1] as i64;
            for k in 0..2 {
                if divx_500_413 {
                    sr[k] = a * vop_ref[i][k] + acc[k];
                } else {
                    sr[k] = (a >> 1) * (2 * vop_ref[i][k] + acc[k]);
                }
            }
        }

        let mut virtual_ref = [[0i64; 2]; 2];
        virtual_ref[0][0] = 16 * (vop_ref[0][0] + w2)
            + rounded_div64(
                (w - w2) * (r * sprite_ref[0][0] - 16 * vop_ref[0][0])
                    + w2 * (r * sprite_ref[1][0] - 16 * vop_ref[1][0]),
                w,
            );
        virtual_ref[0][1] = 16 * vop_ref[0][1]
            + rounded_div64(
                (w - w2) * (r * sprite_ref[0][1] - 16 * vop_ref[0][1])
                    + w2 * (r * sprite_ref[1][1] - 16 * vop_ref[1][1]),
                w,
            );
        virtual_ref[1][0] = 16 * vop_ref[0][0]
            + rounded_div64(
                (h - h2) * (r * sprite_ref[0][0] - 16 * vop_ref[0][0])
                    + h2 * (r * sprite_ref[2][0] - 16 * vop_ref[2][0]),
                h,
            );
        virtual_ref[1][1] = 16 * (vop_ref[0][1] + h2)
            + rounded_div64(
                (h - h2) * (r * sprite_ref[0][1] - 16 * vop_ref[0][1])
                    + h2 * (r * sprite_ref[2][1] - 16 * vop_ref[2][1]),
                h,
            );

        let mut offset = [[0i64; 2]; 2];
        let mut delta = [[0i64; 2]; 2];
        let mut shift = [0u32; 2];

        match self.seq.num_sprite_warping_points {
            0 => {
                delta[0][0] = a;
                delta[1][1] = a;
            }
            1 => {
                for i in 0..2 {
                    offset[0][i] = sprite_ref[0][i] - a * vop_ref[0][i];
                    offset[1][i] = ((sprite_ref[0][i] >> 1) | (sprite_ref[0][i] & 1))
                        - a * (vop_ref[0][i] / 2);
                }
                delta[0][0] = a;
                delta[1][1] = a;
            }
            2 => {
                offset[0][0] = sprite_ref[0][0] * (1 << (alpha + rho))
                    + (-r * sprite_ref[0][0] + virtual_ref[0][0]) * (-vop_ref[0][0])
                    + (r * sprite_ref[0][1] - virtual_ref[0][1]) * (-vop_ref[0][1])
                    + ((1i64 << (alpha + rho)) >> 1);
                offset[0][1] = sprite_ref[0][1] * (1 << (alpha + rho))
                    + (-r * sprite_ref[0][1] + virtual_ref[0][1]) * (-vop_ref[0][0])
                    + (-r * sprite_ref[0][0] + virtual_ref[0][0]) * (-vop_ref[0][1])
                    + ((1i64 << (alpha + rho)) >> 1);
                offset[1][0] = (-r * sprite_ref[0][0] + virtual_ref[0][0])
                    * (-2 * vop_ref[0][0] + 1)
                    + (r * sprite_ref[0][1] - virtual_ref[0][1]) * (-2 * vop_ref[0][1] + 1)
                    + 2 * w2 * r * sprite_ref[0][0]
                    - 16 * w2
                    + (1 << (alpha + rho + 1));
                offset[1][1] = (-r * sprite_ref[0][1] + virtual_ref[0][1])
                    * (-2 * vop_ref[0][0] + 1)
                    + (-r * sprite_ref[0][0] + virtual_ref[0][0]) * (-2 * vop_ref[0][1] + 1)
                    + 2 * w2 * r * sprite_ref[0][1]
                    - 16 * w2
                    + (1 << (alpha + rho + 1));
                delta[0][0] = -r * sprite_ref[0][0] + virtual_ref[0][0];
                delta[0][1] = r * sprite_ref[0][1] - virtual_ref[0][1];
                delta[1][0] = -r * sprite_ref[0][1] + virtual_ref[0][1];
                delta[1][1] = -r * sprite_ref[0][0] + virtual_ref[0][0];
                shift[0] = alpha + rho;
                shift[1] = alpha + rho + 2;
            }
            _ => {
                let min_ab = alpha.min(beta);
                let w3 = w2 >> min_ab;
                let h3 = h2 >> min_ab;
                for i in 0..2 {
                    offset[0][i] = sprite_ref[0][i] * (1 << (alpha + beta + rho - min_ab))
                        + (-r * sprite_ref[0][i] + virtual_ref[0][i]) * h3 * (-vop_ref[0][0])
                        + (-r * sprite_ref[0][i] + virtual_ref[1][i]) * w3 * (-vop_ref[0][1])
                        + ((1i64 << (alpha + beta + rho - min_ab)) >> 1);
                    offset[1][i] = (-r * sprite_ref[0][i] + virtual_ref[0][i])
                        * h3
                        * (-2 * vop_ref[0][0] + 1)
                        + (-r * sprite_ref[0][i] + virtual_ref[1][i])
                            * w3
                            * (-2 * vop_ref[0][1] + 1)
                        + 2 * w2 * h3 * r * sprite_ref[0][i]
                        - 16 * w2 * h3
                        + (1 << (alpha + beta + rho - min_ab + 1));
                }
                delta[0][0] = (-r * sprite_ref[0][0] + virtual_ref[0][0]) * h3;
                delta[0][1] = (-r * sprite_ref[0][0] + virtual_ref[1][0]) * w3;
                delta[1][0] = (-r * sprite_ref[0][1] + virtual_ref[0][1]) * h3;
                delta[1][1] = (-r * sprite_ref[0][1] + virtual_ref[1][1]) * w3;
                shift[0] = alpha + beta + rho - min_ab;
                shift[1] = alpha + beta + rho - min_ab + 2;
            }
        }

        // 仿射矩阵退化为纯平移时化简为单点形式
        if delta[0][0] == a << shift[0]
            && delta[0][1] == 0
            && delta[1][0] == 0
            && delta[1][1] == a << shift[0]
        {
            offset[0][0] >>= shift[0];
            offset[0][1] >>= shift[0];
            offset[1][0] >>= shift[1];
            offset[1][1] >>= shift[1];
            delta[0][0] = a;
            delta[0][1] = 0;
            delta[1][0] = 0;
            delta[1][1] = a;
            shift[0] = 0;
            shift[1] = 0;
            self.gmc.real_points = 1;
        } else {
            let shift_y = 16i32 - shift[0] as i32;
            let shift_c = 16i32 - shift[1] as i32;
            let limit = i32::MAX as i64;
            for i in 0..2 {
                if shift_c < 0
                    || shift_y < 0
                    || offset[0][i].abs() >= limit >> shift_y
                    || offset[1][i].abs() >= limit >> shift_c
                    || delta[0][i].abs() >= limit >> shift_y
                    || delta[1][i].abs() >= limit >> shift_y
                {
                    return self.sprite_overflow();
                }
            }
            for i in 0..2 {
                offset[0][i] <<= shift_y;
                offset[1][i] <<= shift_c;
                delta[0][i] <<= shift_y;
                delta[1][i] <<= shift_y;
                shift[i] = 16;
            }
            for i in 0..2 {
                let sd = [delta[i][0] - a * (1 << 16), delta[i][1] - a * (1 << 16)];
                if (offset[0][i] + delta[i][0] * (w + 16)).abs() >= limit
                    || (offset[0][i] + delta[i][1] * (h + 16)).abs() >= limit
                    || (offset[0][i] + delta[i][0] * (w + 16) + delta[i][1] * (h + 16)).abs()
                        >= limit
                    || (delta[i][0] * (w + 16)).abs() >= limit
                    || (delta[i][1] * (h + 16)).abs() >= limit
                    || sd[0].abs() >= limit
                    || sd[1].abs() >= limit
                    || (offset[0][i] + sd[0] * (w + 16)).abs() >= limit
                    || (offset[0][i] + sd[1] * (h + 16)).abs() >= limit
                    || (offset[0][i] + sd[0] * (w + 16) + sd[1] * (h + 16)).abs() >= limit
                {
                    return self.sprite_overflow();
                }
            }
            self.gmc.real_points = self.seq.num_sprite_warping_points;
        }

        self.gmc.offset = offset;
        self.gmc.delta = delta;
        self.gmc.shift = shift;
        Ok(())
    }

    fn sprite_overflow(&mut self) -> MeiResult<()> {
        error!("sprite 参数溢出, GMC 参数清零");
        self.gmc.clear();
        Err(MeiError::Unsupported("sprite 参数溢出".into()))
    }

    /// GMC 宏块的平均运动向量 (分量 n: 0=x, 1=y)
    ///
    /// 单点化简情形直接缩放 offset; 一般情形对 16x16 像素求仿射位移均值.
    pub(super) fn gmc_average_mv(&self, n: usize, mb_x: usize, mb_y: usize) -> i32 {
        let accuracy = self.seq.sprite_warping_accuracy as u32;
        let qpel = self.seq.quarter_sample as u32;
        let mut len = 1i64 << (self.pic.f_code + 4);
        if self.bugs.contains(BugFlags::AMV) {
            len >>= qpel;
        }

        let sum = if self.gmc.real_points == 1 {
            let divx_500_413 =
                self.encoder.divx_version == 500 && self.encoder.divx_build == 413;
            if divx_500_413 && accuracy >= qpel {
                self.gmc.offset[0][n] / (1 << (accuracy - qpel))
            } else {
                rshift(self.gmc.offset[0][n] << qpel, accuracy)
            }
        } else {
            let mut dx = self.gmc.delta[n][0];
            let mut dy = self.gmc.delta[n][1];
            let shift = self.gmc.shift[0];
            if n != 0 {
                dy -= 1 << (shift + accuracy + 1);
            } else {
                dx -= 1 << (shift + accuracy + 1);
            }
            let mb_v = self.gmc.offset[0][n] + dx * mb_x as i64 * 16 + dy * mb_y as i64 * 16;
            let mut sum = 0i64;
            for y in 0..16 {
                let mut v = mb_v + dy * y;
                for _ in 0..16 {
                    sum += v >> shift;
                    v += dx;
                }
            }
            rshift(sum, accuracy + 8 - qpel)
        };

        sum.clamp(-len, len - 1) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::super::Mpeg4Decoder;
    use super::super::types::{PictureType, SpriteMode};
    use mei_core::BitReader;

    fn gmc_decoder() -> Mpeg4Decoder {
        let mut d = Mpeg4Decoder::new();
        d.set_dimensions(352, 288);
        d.seq.sprite = SpriteMode::Gmc;
        d.seq.num_sprite_warping_points = 1;
        d.seq.sprite_warping_accuracy = 3;
        d.pic.picture_type = PictureType::S;
        d.pic.f_code = 1;
        d
    }

    #[test]
    fn test_single_point_zero_displacement() {
        let mut d = gmc_decoder();
        d.compute_sprite_params(&[[0; 2]; 4]).unwrap();
        assert_eq!(d.gmc.real_points, 1);
        assert_eq!(d.gmc.offset, [[0; 2]; 2]);
        assert_eq!(d.gmc.delta[0][0], 16); // a = 2 << accuracy
        assert_eq!(d.gmc.delta[1][1], 16);
        assert_eq!(d.gmc.shift, [0, 0]);
        assert_eq!(d.gmc_average_mv(0, 0, 0), 0);
        assert_eq!(d.gmc_average_mv(1, 3, 2), 0);
    }

    #[test]
    fn test_single_point_translation() {
        let mut d = gmc_decoder();
        // 半像素单位的位移 (6, -4), accuracy=3 下 offset 为 8 倍
        d.compute_sprite_params(&[[6, -4], [0, 0], [0, 0], [0, 0]]).unwrap();
        assert_eq!(d.gmc.real_points, 1);
        assert_eq!(d.gmc.offset[0], [48, -32]);
        assert_eq!(d.gmc_average_mv(0, 0, 0), 6);
        assert_eq!(d.gmc_average_mv(1, 0, 0), -4);
    }

    #[test]
    fn test_amv_clamped_to_f_code_range() {
        let mut d = gmc_decoder();
        d.seq.sprite_warping_accuracy = 0;
        // f_code=1: 范围 [-32, 31]
        d.compute_sprite_params(&[[100, -100], [0, 0], [0, 0], [0, 0]]).unwrap();
        assert_eq!(d.gmc_average_mv(0, 0, 0), 31);
        assert_eq!(d.gmc_average_mv(1, 0, 0), -32);
    }

    #[test]
    fn test_two_point_rotation_keeps_points() {
        let mut d = gmc_decoder();
        d.seq.num_sprite_warping_points = 2;
        // 第二点的差分位移引入非对角 delta, 不可化简
        d.compute_sprite_params(&[[2, 2], [3, -5], [0, 0], [0, 0]]).unwrap();
        assert_eq!(d.gmc.real_points, 2);
        assert_eq!(d.gmc.shift, [16, 16]);
    }

    #[test]
    fn test_sprite_overflow_zeroes_state() {
        let mut d = gmc_decoder();
        d.seq.num_sprite_warping_points = 2;
        // 巨大位移触发溢出防护
        assert!(
            d.compute_sprite_params(&[[16000, 16000], [-16000, 16000], [0, 0], [0, 0]])
                .is_err()
        );
        assert_eq!(d.gmc.offset, [[0; 2]; 2]);
        assert_eq!(d.gmc.delta, [[0; 2]; 2]);
        assert_eq!(d.gmc.real_points, 0);
    }

    #[test]
    fn test_trajectory_bitstream_roundtrip() {
        // 单点 (x=+2, y=-1): 长度 VLC "011"=2 + xbits "10" + marker
        //                    长度 VLC "010"=1 + xbits "0" + marker
        let bits = "011 10 1 010 0 1".replace(' ', "");
        let mut padded = bits.clone();
        while padded.len() % 8 != 0 {
            padded.push('0');
        }
        let data: Vec<u8> = padded
            .as_bytes()
            .chunks(8)
            .map(|c| u8::from_str_radix(std::str::from_utf8(c).unwrap(), 2).unwrap())
            .collect();
        let mut d = gmc_decoder();
        let mut r = BitReader::new(&data);
        d.decode_sprite_trajectory(&mut r).unwrap();
        // accuracy=3: sprite_ref = 8 * d
        assert_eq!(d.gmc.offset[0], [16, -8]);
    }
}
