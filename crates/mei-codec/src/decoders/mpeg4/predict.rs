//! 帧内 DC/AC 系数预测
//!
//! 每帧维护一个带左/上边界的 DC 平面 (亮度按 8x8 块网格, 色度按宏块
//! 网格, 边界填充 1024) 和对应的 AC 行列缓存 (每块 16 个系数: 左列 8
//! 个 + 顶行 8 个). 预测方向由三邻域梯度决定, 量化尺度不同的邻块在
//! AC 预测时按比例重缩放.

use log::error;
use mei_core::{MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::types::{BugFlags, PredDir};

/// DC/AC 预测平面
#[derive(Debug, Default)]
pub(super) struct PredictionState {
    /// 亮度 DC, (2*mb_w+1) x (2*mb_h+1), 首行首列为 1024 边界
    luma_dc: Vec<i16>,
    /// 色度 DC (Cb, Cr), (mb_w+1) x (mb_h+1)
    chroma_dc: [Vec<i16>; 2],
    luma_ac: Vec<[i16; 16]>,
    chroma_ac: [Vec<[i16; 16]>; 2],
    b8_stride: usize,
    mb_stride: usize,
}

impl PredictionState {
    pub(super) fn resize(&mut self, mb_width: usize, mb_height: usize) {
        self.b8_stride = 2 * mb_width + 1;
        self.mb_stride = mb_width + 1;
        self.luma_dc = vec![1024; self.b8_stride * (2 * mb_height + 1)];
        self.luma_ac = vec![[0; 16]; self.b8_stride * (2 * mb_height + 1)];
        for i in 0..2 {
            self.chroma_dc[i] = vec![1024; self.mb_stride * (mb_height + 1)];
            self.chroma_ac[i] = vec![[0; 16]; self.mb_stride * (mb_height + 1)];
        }
    }

    /// 帧起始时恢复边界值并清空 AC 缓存
    pub(super) fn reset(&mut self) {
        self.luma_dc.fill(1024);
        for plane in self.luma_ac.iter_mut() {
            *plane = [0; 16];
        }
        for i in 0..2 {
            self.chroma_dc[i].fill(1024);
            for plane in self.chroma_ac[i].iter_mut() {
                *plane = [0; 16];
            }
        }
    }

    /// 块 n 在所属 DC 平面中的下标
    fn index(&self, n: usize, mb_x: usize, mb_y: usize) -> usize {
        if n < 4 {
            (2 * mb_y + (n >> 1) + 1) * self.b8_stride + 2 * mb_x + (n & 1) + 1
        } else {
            (mb_y + 1) * self.mb_stride + mb_x + 1
        }
    }

    fn dc_plane(&self, n: usize) -> &[i16] {
        match n {
            0..=3 => &self.luma_dc,
            4 => &self.chroma_dc[0],
            _ => &self.chroma_dc[1],
        }
    }

    fn dc_plane_mut(&mut self, n: usize) -> &mut [i16] {
        match n {
            0..=3 => &mut self.luma_dc,
            4 => &mut self.chroma_dc[0],
            _ => &mut self.chroma_dc[1],
        }
    }

    fn ac_plane_mut(&mut self, n: usize) -> &mut [[i16; 16]] {
        match n {
            0..=3 => &mut self.luma_ac,
            4 => &mut self.chroma_ac[0],
            _ => &mut self.chroma_ac[1],
        }
    }

    fn wrap(&self, n: usize) -> usize {
        if n < 4 { self.b8_stride } else { self.mb_stride }
    }

    pub(super) fn dc_at(&self, n: usize, mb_x: usize, mb_y: usize) -> i32 {
        self.dc_plane(n)[self.index(n, mb_x, mb_y)] as i32
    }

    pub(super) fn set_dc(&mut self, n: usize, mb_x: usize, mb_y: usize, value: i16) {
        let idx = self.index(n, mb_x, mb_y);
        self.dc_plane_mut(n)[idx] = value;
    }
}

impl Mpeg4Decoder {
    /// DC 预测: 由左/左上/上三邻块的梯度选出预测值与方向
    pub(super) fn pred_dc(&self, n: usize) -> (i32, PredDir) {
        let plane = self.pred.dc_plane(n);
        let wrap = self.pred.wrap(n);
        let xy = self.pred.index(n, self.mb_x, self.mb_y);

        let mut a = plane[xy - 1] as i32;
        let mut b = plane[xy - 1 - wrap] as i32;
        let mut c = plane[xy - wrap] as i32;

        // 切片首行: 上方邻块属于前一切片, 不可用
        if self.first_slice_line && n != 3 {
            if n != 2 {
                b = 1024;
                c = 1024;
            }
            if n != 1 && self.mb_x == self.resync_mb_x {
                b = 1024;
                a = 1024;
            }
        }
        if self.mb_x == self.resync_mb_x
            && self.mb_y == self.resync_mb_y + 1
            && (n == 0 || n == 4 || n == 5)
        {
            b = 1024;
        }

        if (a - b).abs() < (b - c).abs() {
            (c, PredDir::Top)
        } else {
            (a, PredDir::Left)
        }
    }

    /// 叠加预测并反量化 DC, 把缩放后的值写回平面.
    /// 返回量化域的 DC (供 AC 预测路径继续使用).
    pub(super) fn get_level_dc(&mut self, n: usize, pred: i32, level: i32) -> MeiResult<i32> {
        let scale = if n < 4 {
            self.y_dc_scale as i32
        } else {
            self.c_dc_scale as i32
        };

        let pred = (pred + (scale >> 1)) / scale;
        let level = level + pred;
        let ret = level;
        let mut level = level * scale;
        if level & !2047 != 0 {
            if self.strict {
                if level < 0 {
                    error!("DC 预测结果为负 ({}, 块 {})", level, n);
                    return Err(MeiError::InvalidData("DC < 0".into()));
                }
                if level > 2048 + scale {
                    error!("DC 溢出 ({}, 块 {})", level, n);
                    return Err(MeiError::InvalidData("DC 溢出".into()));
                }
            }
            if level < 0 {
                level = 0;
            } else if !self.bugs.contains(BugFlags::DC_CLIP) {
                level = 2047;
            }
        }
        self.pred.set_dc(n, self.mb_x, self.mb_y, level as i16);
        Ok(ret)
    }

    /// AC 预测: 按方向叠加邻块的首行/首列系数, 随后把本块的
    /// 首行/首列存回缓存供右方与下方邻块使用
    pub(super) fn pred_ac(&mut self, block: &mut [i16; 64], n: usize, dir: PredDir, ac_pred: bool) {
        let wrap = self.pred.wrap(n);
        let xy = self.pred.index(n, self.mb_x, self.mb_y);
        let perm = self.idct_permutation;
        let qscale = self.qscale as i32;

        if ac_pred {
            match dir {
                PredDir::Left => {
                    let neighbor = self.pred.ac_plane_mut(n)[xy - 1];
                    let same_scale = self.mb_x == 0 || n == 1 || n == 3 || {
                        let left_xy = self.mb_y * self.mb_width + self.mb_x - 1;
                        self.qscale_table[left_xy] as i32 == qscale
                    };
                    for i in 1..8 {
                        let v = if same_scale {
                            neighbor[i] as i32
                        } else {
                            let left_xy = self.mb_y * self.mb_width + self.mb_x - 1;
                            rounded_div(neighbor[i] as i32 * self.qscale_table[left_xy] as i32, qscale)
                        };
                        block[perm[i << 3] as usize] =
                            block[perm[i << 3] as usize].wrapping_add(v as i16);
                    }
                }
                PredDir::Top => {
                    let neighbor = self.pred.ac_plane_mut(n)[xy - wrap];
                    let same_scale = self.mb_y == 0 || n == 2 || n == 3 || {
                        let top_xy = (self.mb_y - 1) * self.mb_width + self.mb_x;
                        self.qscale_table[top_xy] as i32 == qscale
                    };
                    for i in 1..8 {
                        let v = if same_scale {
                            neighbor[8 + i] as i32
                        } else {
                            let top_xy = (self.mb_y - 1) * self.mb_width + self.mb_x;
                            rounded_div(
                                neighbor[8 + i] as i32 * self.qscale_table[top_xy] as i32,
                                qscale,
                            )
                        };
                        block[perm[i] as usize] = block[perm[i] as usize].wrapping_add(v as i16);
                    }
                }
            }
        }

        let entry = &mut self.pred.ac_plane_mut(n)[xy];
        for i in 1..8 {
            entry[i] = block[perm[i << 3] as usize];
            entry[8 + i] = block[perm[i] as usize];
        }
    }
}

fn rounded_div(a: i32, b: i32) -> i32 {
    if (a > 0) == (b > 0) {
        (a + b / 2) / b
    } else {
        (a - b / 2) / b
    }
}

#[cfg(test)]
mod tests {
    use super::super::Mpeg4Decoder;
    use super::super::types::{BugFlags, PredDir};

    fn decoder_4x3() -> Mpeg4Decoder {
        let mut d = Mpeg4Decoder::new();
        d.set_dimensions(64, 48);
        d.set_qscale(4); // y_dc_scale = 8, c_dc_scale = 8
        d
    }

    #[test]
    fn test_dc_prediction_defaults_to_left() {
        let d = decoder_4x3();
        // 边界三邻块均为 1024: |a-b| == |b-c|, 取左
        let (pred, dir) = d.pred_dc(0);
        assert_eq!(pred, 1024);
        assert_eq!(dir, PredDir::Left);
    }

    #[test]
    fn test_dc_prediction_prefers_smooth_direction() {
        let mut d = decoder_4x3();
        d.mb_x = 1;
        d.mb_y = 1;
        d.first_slice_line = false;
        // 块 0 的左/左上/上分别是 mb(0,1) 块 1, mb(0,0) 块 3, mb(1,0) 块 2;
        // 左 800, 左上 802, 上 1500: 水平梯度更小, 预测取上方
        d.pred.set_dc(1, 0, 1, 800);
        d.pred.set_dc(3, 0, 0, 802);
        d.pred.set_dc(2, 1, 0, 1500);
        let (pred, dir) = d.pred_dc(0);
        assert_eq!(pred, 1500);
        assert_eq!(dir, PredDir::Top);
    }

    #[test]
    fn test_first_slice_line_masks_top_neighbors() {
        let mut d = decoder_4x3();
        d.mb_x = 1;
        d.mb_y = 0;
        d.first_slice_line = true;
        d.resync_mb_x = 0;
        d.pred.set_dc(2, 1, 0, 123); // 本应是块 0 的上邻
        d.pred.set_dc(1, 0, 0, 500); // 左邻
        let (pred, dir) = d.pred_dc(0);
        // 上方被屏蔽为 1024, 梯度判定落到左邻
        assert_eq!(pred, 500);
        assert_eq!(dir, PredDir::Left);
    }

    #[test]
    fn test_get_level_dc_rescales_and_stores() {
        let mut d = decoder_4x3();
        // pred=1024, scale=8: 量化域 pred = 128
        let ret = d.get_level_dc(0, 1024, 10).unwrap();
        assert_eq!(ret, 138);
        assert_eq!(d.pred.dc_at(0, 0, 0), 138 * 8);
    }

    #[test]
    fn test_get_level_dc_clips_overflow() {
        let mut d = decoder_4x3();
        let _ = d.get_level_dc(0, 1024, 200).unwrap();
        // (128+200)*8 = 2624 > 2047, 非严格模式截断
        assert_eq!(d.pred.dc_at(0, 0, 0), 2047);

        let mut d = decoder_4x3();
        d.bugs |= BugFlags::DC_CLIP;
        let _ = d.get_level_dc(0, 1024, 200).unwrap();
        assert_eq!(d.pred.dc_at(0, 0, 0), 2624);
    }

    #[test]
    fn test_get_level_dc_strict_rejects_overflow() {
        let mut d = decoder_4x3();
        d.strict = true;
        assert!(d.get_level_dc(0, 1024, 300).is_err());
        assert!(d.get_level_dc(0, 0, -5).is_err());
    }

    #[test]
    fn test_ac_prediction_left_column() {
        let mut d = decoder_4x3();
        d.first_slice_line = false;
        // 在 mb(0,0) 块 1 存入一列 AC 系数
        d.qscale_table[0] = 4;
        let mut left = [0i16; 64];
        for i in 1..8 {
            left[i << 3] = i as i16 * 10;
        }
        d.mb_x = 0;
        d.mb_y = 0;
        d.pred_ac(&mut left, 1, PredDir::Left, false);

        // mb(1,0) 块 0 按左方向叠加
        d.mb_x = 1;
        let mut block = [0i16; 64];
        block[8] = 7;
        d.pred_ac(&mut block, 0, PredDir::Left, true);
        assert_eq!(block[8], 17);
        assert_eq!(block[16], 20);
        assert_eq!(block[56], 70);
    }

    #[test]
    fn test_ac_prediction_rescales_across_qscale() {
        let mut d = decoder_4x3();
        d.first_slice_line = false;
        d.qscale_table[0] = 8;
        let mut left = [0i16; 64];
        left[8] = 30;
        d.mb_x = 0;
        d.mb_y = 0;
        d.pred_ac(&mut left, 1, PredDir::Left, false);

        d.mb_x = 1;
        d.set_qscale(4);
        let mut block = [0i16; 64];
        d.pred_ac(&mut block, 0, PredDir::Left, true);
        // 30 * 8 / 4 = 60
        assert_eq!(block[8], 60);
    }
}
