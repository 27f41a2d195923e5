//! 运动向量解码与预测
//!
//! MV 差分用幅值 VLC + 符号位 + (f_code-1) 位残差编码, 预测值取
//! 左/上/右上三邻块的中值, 结果按 5+f_code 位做模回绕.

use mei_core::{BitReader, MeiResult};

use super::Mpeg4Decoder;
use super::types::MotionVector;
use super::vlc;

fn sign_extend(val: i32, bits: u32) -> i32 {
    let shift = 32 - bits;
    (val << shift) >> shift
}

impl Mpeg4Decoder {
    /// 三值取中 (用于 MV 预测)
    pub(super) fn median(a: i16, b: i16, c: i16) -> i16 {
        if a > b {
            if b > c {
                b
            } else if a > c {
                c
            } else {
                a
            }
        } else if b < c {
            b
        } else if a < c {
            c
        } else {
            a
        }
    }

    /// 解码一个 MV 分量: 幅值 VLC + 符号 + 残差, 叠加预测后按
    /// 5+f_code 位模回绕
    pub(super) fn decode_motion(
        &self,
        reader: &mut BitReader,
        pred: i16,
        f_code: u8,
    ) -> MeiResult<i16> {
        let code = vlc::decode_mv_magnitude(reader)? as i32;
        if code == 0 {
            return Ok(pred);
        }

        let sign = reader.read_bit()? != 0;
        let shift = (f_code - 1) as u32;
        let mut val = code;
        if shift > 0 {
            val = ((val - 1) << shift) | reader.read_bits(shift)? as i32;
            val += 1;
        }
        if sign {
            val = -val;
        }
        val += pred as i32;

        Ok(sign_extend(val, 5 + f_code as u32) as i16)
    }

    /// 预测 MV: 左/上/右上邻块 MV 的分量中值
    ///
    /// 切片首行的上方邻块不可用, 退化为仅用左邻;
    /// 切片行首连左邻也没有, 预测为零.
    pub(super) fn get_pmv(&self, block_k: usize) -> MotionVector {
        let mb_x = self.mb_x as i32;
        let mb_y = self.mb_y as i32;
        let get_mv = |x: i32, y: i32, k: usize| -> MotionVector {
            if x < 0 || y < 0 || x >= self.mb_width as i32 || y >= self.mb_height as i32 {
                return MotionVector::default();
            }
            self.mv_cache[y as usize * self.mb_width + x as usize][k]
        };

        let (a, b, c) = match block_k {
            0 => {
                // A: 左 MB 块 1, B: 上 MB 块 2, C: 右上 MB 块 2
                let a = get_mv(mb_x - 1, mb_y, 1);
                if self.first_slice_line {
                    if self.mb_x == self.resync_mb_x {
                        return MotionVector::default();
                    }
                    return a;
                }
                (a, get_mv(mb_x, mb_y - 1, 2), get_mv(mb_x + 1, mb_y - 1, 2))
            }
            1 => {
                let a = get_mv(mb_x, mb_y, 0);
                if self.first_slice_line {
                    return a;
                }
                (a, get_mv(mb_x, mb_y - 1, 3), get_mv(mb_x + 1, mb_y - 1, 2))
            }
            2 => {
                // B/C 在同一宏块内, 首行也可用
                let mut a = get_mv(mb_x - 1, mb_y, 3);
                if self.first_slice_line && self.mb_x == self.resync_mb_x {
                    a = MotionVector::default();
                }
                (a, get_mv(mb_x, mb_y, 0), get_mv(mb_x, mb_y, 1))
            }
            _ => (
                get_mv(mb_x, mb_y, 2),
                get_mv(mb_x, mb_y, 1),
                get_mv(mb_x, mb_y, 0),
            ),
        };

        MotionVector {
            x: Self::median(a.x, b.x, c.x),
            y: Self::median(a.y, b.y, c.y),
        }
    }

    /// 解码一个完整 MV (预测 + 两个差分分量)
    pub(super) fn decode_motion_vector(
        &self,
        reader: &mut BitReader,
        block_k: usize,
        f_code: u8,
    ) -> MeiResult<MotionVector> {
        let pred = self.get_pmv(block_k);
        let x = self.decode_motion(reader, pred.x, f_code)?;
        let y = self.decode_motion(reader, pred.y, f_code)?;
        Ok(MotionVector { x, y })
    }

    /// 把当前宏块的 MV 写入缓存供邻块预测
    pub(super) fn store_mb_mvs(&mut self, mvs: [MotionVector; 4]) {
        let xy = self.mb_y * self.mb_width + self.mb_x;
        self.mv_cache[xy] = mvs;
    }

    /// B-VOP 直接模式: 按时间距离缩放同位宏块的 MV
    ///
    /// 前向 MV = pb/pp 缩放 + 差分; 差分为零时后向 MV 由 (pb-pp)/pp
    /// 缩放得出, 否则为前向 MV 减同位 MV.
    pub(super) fn set_direct_mv(&mut self, delta: MotionVector) {
        let xy = self.mb_y * self.mb_width + self.mb_x;
        let time_pp = self.pp_time.max(1) as i32;
        let time_pb = self.pb_time as i32;

        for i in 0..4 {
            let co = self.ref_mv_cache[xy][i];
            let fx = (time_pb * co.x as i32) / time_pp + delta.x as i32;
            let fy = (time_pb * co.y as i32) / time_pp + delta.y as i32;
            let (bx, by) = if delta.x == 0 && delta.y == 0 {
                (
                    ((time_pb - time_pp) * co.x as i32) / time_pp,
                    ((time_pb - time_pp) * co.y as i32) / time_pp,
                )
            } else {
                (fx - co.x as i32, fy - co.y as i32)
            };
            self.b_mvs_forward[i] = MotionVector { x: fx as i16, y: fy as i16 };
            self.b_mvs_backward[i] = MotionVector { x: bx as i16, y: by as i16 };
        }
    }
}
