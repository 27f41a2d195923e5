//! MPEG-4 Part 2 固定常量表
//!
//! 扫描序, DC 缩放, 默认量化矩阵等标准附录中的定值.
//! VLC 码表在 vlc.rs 中单独维护.

// ==== 起始码 ====

pub const VOS_STARTCODE: u32 = 0x1B0;
pub const USER_DATA_STARTCODE: u32 = 0x1B2;
pub const GOP_STARTCODE: u32 = 0x1B3;
pub const VISUAL_OBJ_STARTCODE: u32 = 0x1B5;
pub const VOP_STARTCODE: u32 = 0x1B6;
pub const SLICE_STARTCODE: u32 = 0x1B7;
pub const EXT_STARTCODE: u32 = 0x1B8;

/// studio 扩展类型: 量化矩阵扩展
pub const QUANT_MATRIX_EXT_ID: u32 = 0x3;

/// 数据分区 I 帧的分区间标记 (19 位)
pub const DC_MARKER: u32 = 0x6B001;
/// 数据分区 P/S 帧的分区间标记 (17 位)
pub const MOTION_MARKER: u32 = 0x1F001;

// ==== 扫描序 ====

/// 标准 zig-zag 扫描
pub const ZIGZAG_SCAN: [u8; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// 垂直优先交替扫描 (AC 预测方向为左, 或隔行 alternate_scan)
pub const ALTERNATE_VERTICAL_SCAN: [u8; 64] = [
    0, 8, 16, 24, 1, 9, 2, 10, 17, 25, 32, 40, 48, 56, 57, 49, 41, 33, 26, 18, 3, 11, 4, 12, 19,
    27, 34, 42, 50, 58, 35, 43, 51, 59, 20, 28, 5, 13, 6, 14, 21, 29, 36, 44, 52, 60, 37, 45, 53,
    61, 22, 30, 7, 15, 23, 31, 38, 46, 54, 62, 39, 47, 55, 63,
];

/// 水平优先交替扫描 (AC 预测方向为上)
pub const ALTERNATE_HORIZONTAL_SCAN: [u8; 64] = [
    0, 1, 2, 3, 8, 9, 16, 17, 10, 11, 4, 5, 6, 7, 15, 14, 13, 12, 19, 18, 24, 25, 32, 33, 26, 27,
    20, 21, 22, 23, 28, 29, 30, 31, 40, 41, 48, 49, 42, 43, 34, 35, 36, 37, 38, 39, 50, 51, 58,
    59, 52, 53, 60, 61, 44, 45, 46, 47, 54, 55, 62, 63, 56, 57,
];

// ==== DC 缩放 ====

/// 亮度 DC 量化步长, 以 qscale 索引
pub const Y_DC_SCALE_TABLE: [u8; 32] = [
    0, 8, 8, 8, 8, 10, 12, 14, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31,
    32, 34, 36, 38, 40, 42, 44, 46,
];

/// 色度 DC 量化步长, 以 qscale 索引
pub const C_DC_SCALE_TABLE: [u8; 32] = [
    0, 8, 8, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16, 16, 17, 17, 18, 18,
    19, 20, 21, 22, 23, 24, 25,
];

/// intra_dc_vlc_thr 取值映射为 qscale 阈值
/// (99 表示始终用 intra DC VLC, 0 表示始终用 AC VLC)
pub const DC_THRESHOLD_TABLE: [u8; 8] = [99, 13, 15, 17, 19, 21, 23, 0];

// ==== 量化 ====

/// 默认 intra 量化矩阵 (自然顺序)
pub const DEFAULT_INTRA_MATRIX: [u16; 64] = [
    8, 17, 18, 19, 21, 23, 25, 27, 17, 18, 19, 21, 23, 25, 27, 28, 20, 21, 22, 23, 24, 26, 28,
    30, 21, 22, 23, 24, 26, 28, 30, 32, 22, 23, 24, 26, 28, 30, 32, 35, 23, 24, 26, 28, 30, 32,
    35, 38, 25, 26, 28, 30, 32, 35, 38, 41, 27, 28, 30, 32, 35, 38, 41, 45,
];

/// 默认 inter 量化矩阵 (自然顺序)
pub const DEFAULT_INTER_MATRIX: [u16; 64] = [
    16, 17, 18, 19, 20, 21, 22, 23, 17, 18, 19, 20, 21, 22, 23, 24, 18, 19, 20, 21, 22, 23, 24,
    25, 19, 20, 21, 22, 23, 24, 25, 27, 20, 21, 22, 23, 25, 26, 27, 28, 21, 22, 23, 24, 26, 27,
    28, 30, 22, 23, 24, 26, 27, 28, 30, 31, 23, 24, 25, 27, 28, 30, 31, 33,
];

/// dquant 两位码到 qscale 增量的映射
pub const DQUANT_TAB: [i8; 4] = [-1, -2, 1, 2];

// ==== studio profile ====

/// studio AC 系数状态机: (附加码位宽, 下一状态的 VLC 表序号)
///
/// 按 AC 组号 (0..=21) 索引. 组 0 为 EOB, 组 21 为逃逸.
pub const STUDIO_AC_STATE: [[u8; 2]; 22] = [
    [0, 0],
    [0, 1],
    [1, 1],
    [2, 1],
    [3, 1],
    [4, 1],
    [5, 1],
    [1, 2],
    [2, 2],
    [3, 2],
    [4, 2],
    [5, 2],
    [6, 2],
    [1, 3],
    [2, 4],
    [3, 5],
    [4, 6],
    [5, 7],
    [6, 8],
    [7, 9],
    [8, 10],
    [0, 11],
];

/// 以 2 为底向上取整的对数, GMC 透视参数的尺寸基
pub fn ceil_log2(v: i32) -> u8 {
    let mut n = 0u8;
    while (1i32 << n) < v {
        n += 1;
    }
    n
}

/// 以 2 为底向下取整的对数 (v 必须为正)
pub fn floor_log2(v: u32) -> u8 {
    (31 - v.leading_zeros()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_tables_are_permutations() {
        for scan in [
            &ZIGZAG_SCAN,
            &ALTERNATE_VERTICAL_SCAN,
            &ALTERNATE_HORIZONTAL_SCAN,
        ] {
            let mut seen = [false; 64];
            for &idx in scan.iter() {
                assert!(!seen[idx as usize]);
                seen[idx as usize] = true;
            }
        }
    }

    #[test]
    fn test_dc_scale_monotonic() {
        for q in 2..32 {
            assert!(Y_DC_SCALE_TABLE[q] >= Y_DC_SCALE_TABLE[q - 1]);
            assert!(C_DC_SCALE_TABLE[q] >= C_DC_SCALE_TABLE[q - 1]);
        }
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(720), 10);
    }

    #[test]
    fn test_floor_log2() {
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(255), 7);
        assert_eq!(floor_log2(256), 8);
    }
}
