//! VLC (变长编码) 码表与符号解码
//!
//! 包含 MCBPC, CBPY, intra DC size, MVD, 游程/级别 (RL), sprite 位移长度
//! 及 studio profile 各码表. RL 表另带 escape 模式所需的 max_level/max_run
//! 边界数组, 在进程内首次使用时一次性构建.

use std::sync::OnceLock;

use mei_core::{BitReader, MeiError, MeiResult};

use super::types::{BMbMode, MbType};

// ============================================================================
// 码表定义
// ============================================================================

/// intra DC size VLC (亮度)
/// 格式: (位数, 码字, dc_size)
const INTRA_DC_SIZE_Y: &[(u8, u16, u8)] = &[
    (3, 0b011, 0),
    (2, 0b11, 1),
    (2, 0b10, 2),
    (3, 0b010, 3),
    (3, 0b001, 4),
    (4, 0b0001, 5),
    (5, 0b00001, 6),
    (6, 0b000001, 7),
    (7, 0b0000001, 8),
    (8, 0b00000001, 9),
    (9, 0b000000001, 10),
    (10, 0b0000000001, 11),
    (11, 0b00000000001, 12),
];

/// intra DC size VLC (色度)
const INTRA_DC_SIZE_UV: &[(u8, u16, u8)] = &[
    (2, 0b11, 0),
    (2, 0b10, 1),
    (2, 0b01, 2),
    (3, 0b001, 3),
    (4, 0b0001, 4),
    (5, 0b00001, 5),
    (6, 0b000001, 6),
    (7, 0b0000001, 7),
    (8, 0b00000001, 8),
    (9, 0b000000001, 9),
    (10, 0b0000000001, 10),
    (11, 0b00000000001, 11),
    (12, 0b000000000001, 12),
];

/// I-VOP MCBPC 表
/// 格式: (位数, 码字, 类别, 色度 cbp); 类别 0=Intra, 1=IntraQ, 255=stuffing
const MCBPC_I: &[(u8, u16, u8, u8)] = &[
    (1, 0b1, 0, 0),
    (3, 0b001, 0, 1),
    (3, 0b010, 0, 2),
    (3, 0b011, 0, 3),
    (4, 0b0001, 1, 0),
    (6, 0b000001, 1, 1),
    (6, 0b000010, 1, 2),
    (6, 0b000011, 1, 3),
    (9, 0b000000001, 255, 0),
];

/// P/S-VOP MCBPC 表
/// 类别 0=Inter, 1=InterQ, 2=Inter4V, 3=Intra, 4=IntraQ, 255=stuffing
const MCBPC_P: &[(u8, u16, u8, u8)] = &[
    (1, 0b1, 0, 0),
    (4, 0b0011, 0, 1),
    (4, 0b0010, 0, 2),
    (6, 0b000101, 0, 3),
    (3, 0b011, 1, 0),
    (7, 0b0000111, 1, 1),
    (7, 0b0000110, 1, 2),
    (9, 0b000000101, 1, 3),
    (3, 0b010, 2, 0),
    (7, 0b0000101, 2, 1),
    (7, 0b0000100, 2, 2),
    (8, 0b00000101, 2, 3),
    (5, 0b00011, 3, 0),
    (8, 0b00000100, 3, 1),
    (8, 0b00000011, 3, 2),
    (7, 0b0000011, 3, 3),
    (6, 0b000100, 4, 0),
    (9, 0b000000100, 4, 1),
    (9, 0b000000011, 4, 2),
    (9, 0b000000010, 4, 3),
    (9, 0b000000001, 255, 0),
];

/// CBPY 表, 值为 intra 语义; inter 宏块由调用方取 `cbpy ^ 0xF`
const CBPY: &[(u8, u16, u8)] = &[
    (4, 0b0011, 0),
    (5, 0b00101, 1),
    (5, 0b00100, 2),
    (4, 0b1001, 3),
    (5, 0b00011, 4),
    (4, 0b0111, 5),
    (6, 0b000010, 6),
    (4, 0b1011, 7),
    (5, 0b00010, 8),
    (6, 0b000011, 9),
    (4, 0b0101, 10),
    (4, 0b1010, 11),
    (4, 0b0100, 12),
    (4, 0b1000, 13),
    (4, 0b0110, 14),
    (2, 0b11, 15),
];

/// MVD 幅值表 (0..=32); 幅值 0 无后继位, 其余跟符号位与 f_code 残差
const MVD_VLC: &[(u8, u16, u8)] = &[
    (1, 0b1, 0),
    (2, 0b01, 1),
    (3, 0b001, 2),
    (4, 0b0001, 3),
    (6, 0b000011, 4),
    (7, 0b0000101, 5),
    (7, 0b0000100, 6),
    (7, 0b0000011, 7),
    (9, 0b000001011, 8),
    (9, 0b000001010, 9),
    (9, 0b000001001, 10),
    (10, 0b0000010001, 11),
    (10, 0b0000010000, 12),
    (10, 0b0000001111, 13),
    (10, 0b0000001110, 14),
    (10, 0b0000001101, 15),
    (10, 0b0000001100, 16),
    (10, 0b0000001011, 17),
    (10, 0b0000001010, 18),
    (10, 0b0000001001, 19),
    (10, 0b0000001000, 20),
    (10, 0b0000000111, 21),
    (10, 0b0000000110, 22),
    (10, 0b0000000101, 23),
    (10, 0b0000000100, 24),
    (11, 0b00000000111, 25),
    (11, 0b00000000110, 26),
    (11, 0b00000000101, 27),
    (11, 0b00000000100, 28),
    (11, 0b00000000011, 29),
    (11, 0b00000000010, 30),
    (12, 0b000000000011, 31),
    (12, 0b000000000010, 32),
];

/// sprite 轨迹位移的长度前缀 VLC (值为 dmv 的位宽 0..=14)
const SPRITE_DMV_LEN_VLC: &[(u8, u16, u8)] = &[
    (2, 0b00, 0),
    (3, 0b010, 1),
    (3, 0b011, 2),
    (3, 0b100, 3),
    (3, 0b101, 4),
    (3, 0b110, 5),
    (4, 0b1110, 6),
    (5, 0b11110, 7),
    (6, 0b111110, 8),
    (7, 0b1111110, 9),
    (8, 0b11111110, 10),
    (9, 0b111111110, 11),
    (10, 0b1111111110, 12),
    (11, 0b11111111110, 13),
    (12, 0b111111111110, 14),
];

/// intra RL 表
/// 格式: (位数, 码字, last, run, level); (last=0, run=0, level=0) 为 escape
const INTRA_RL: &[(u8, u16, bool, u8, i8)] = &[
    (2, 0x2, false, 0, 1),
    (3, 0x6, false, 0, 2),
    (4, 0xF, false, 0, 3),
    (5, 0xD, false, 0, 4),
    (5, 0xC, false, 0, 5),
    (6, 0x15, false, 0, 6),
    (6, 0x13, false, 0, 7),
    (6, 0x12, false, 0, 8),
    (7, 0x17, false, 0, 9),
    (8, 0x1F, false, 0, 10),
    (8, 0x1E, false, 0, 11),
    (8, 0x1D, false, 0, 12),
    (9, 0x25, false, 0, 13),
    (9, 0x24, false, 0, 14),
    (9, 0x23, false, 0, 15),
    (9, 0x21, false, 0, 16),
    (10, 0x21, false, 0, 17),
    (10, 0x20, false, 0, 18),
    (10, 0xF, false, 0, 19),
    (10, 0xE, false, 0, 20),
    (11, 0x7, false, 0, 21),
    (11, 0x6, false, 0, 22),
    (11, 0x20, false, 0, 23),
    (11, 0x21, false, 0, 24),
    (12, 0x50, false, 0, 25),
    (12, 0x51, false, 0, 26),
    (12, 0x52, false, 0, 27),
    (4, 0xE, false, 1, 1),
    (6, 0x14, false, 1, 2),
    (7, 0x16, false, 1, 3),
    (8, 0x1C, false, 1, 4),
    (9, 0x20, false, 1, 5),
    (9, 0x1F, false, 1, 6),
    (10, 0xD, false, 1, 7),
    (11, 0x22, false, 1, 8),
    (12, 0x53, false, 1, 9),
    (12, 0x55, false, 1, 10),
    (5, 0xB, false, 2, 1),
    (7, 0x15, false, 2, 2),
    (9, 0x1E, false, 2, 3),
    (10, 0xC, false, 2, 4),
    (12, 0x56, false, 2, 5),
    (6, 0x11, false, 3, 1),
    (8, 0x1B, false, 3, 2),
    (9, 0x1D, false, 3, 3),
    (10, 0xB, false, 3, 4),
    (6, 0x10, false, 4, 1),
    (9, 0x22, false, 4, 2),
    (10, 0xA, false, 4, 3),
    (6, 0xD, false, 5, 1),
    (9, 0x1C, false, 5, 2),
    (10, 0x8, false, 5, 3),
    (7, 0x12, false, 6, 1),
    (9, 0x1B, false, 6, 2),
    (12, 0x54, false, 6, 3),
    (7, 0x14, false, 7, 1),
    (9, 0x1A, false, 7, 2),
    (12, 0x57, false, 7, 3),
    (8, 0x1A, false, 8, 1),
    (10, 0x9, false, 8, 2),
    (8, 0x19, false, 9, 1),
    (9, 0x19, false, 9, 2),
    (8, 0x18, false, 10, 1),
    (8, 0x17, false, 11, 1),
    (9, 0x18, false, 12, 1),
    (9, 0x17, false, 13, 1),
    (9, 0x16, false, 14, 1),
    (4, 0x7, true, 0, 1),
    (6, 0x8, true, 0, 2),
    (8, 0x1, true, 0, 3),
    (10, 0x1, true, 0, 4),
    (11, 0x1, true, 0, 5),
    (12, 0x1, true, 0, 6),
    (12, 0x8, true, 0, 7),
    (12, 0x9, true, 0, 8),
    (6, 0xC, true, 1, 1),
    (9, 0x9, true, 1, 2),
    (12, 0xA, true, 1, 3),
    (7, 0xA, true, 2, 1),
    (11, 0x23, true, 2, 2),
    (8, 0x9, true, 3, 1),
    (11, 0x2C, true, 3, 2),
    (8, 0xA, true, 4, 1),
    (12, 0xB, true, 4, 2),
    (9, 0x11, true, 5, 1),
    (12, 0x5A, true, 5, 2),
    (9, 0x26, true, 6, 1),
    (12, 0x5B, true, 6, 2),
    (9, 0x27, true, 7, 1),
    (9, 0x2C, true, 8, 1),
    (10, 0x17, true, 9, 1),
    (10, 0x5A, true, 10, 1),
    (10, 0x5B, true, 11, 1),
    (10, 0x98, true, 12, 1),
    (11, 0x132, true, 13, 1),
    (11, 0x133, true, 14, 1),
    (11, 0x134, true, 15, 1),
    (11, 0x135, true, 16, 1),
    (12, 0x26C, true, 17, 1),
    (12, 0x26D, true, 18, 1),
    (12, 0x26E, true, 19, 1),
    (12, 0x26F, true, 20, 1),
    (7, 0x3, false, 0, 0), // escape
];

/// inter RL 表
const INTER_RL: &[(u8, u16, bool, u8, i8)] = &[
    (2, 0x2, false, 0, 1),
    (4, 0xF, false, 0, 2),
    (6, 0x15, false, 0, 3),
    (7, 0x17, false, 0, 4),
    (8, 0x1F, false, 0, 5),
    (9, 0x25, false, 0, 6),
    (9, 0x24, false, 0, 7),
    (10, 0x21, false, 0, 8),
    (10, 0x20, false, 0, 9),
    (11, 0x7, false, 0, 10),
    (11, 0x6, false, 0, 11),
    (11, 0x20, false, 0, 12),
    (3, 0x6, false, 1, 1),
    (6, 0x14, false, 1, 2),
    (8, 0x1E, false, 1, 3),
    (10, 0xF, false, 1, 4),
    (11, 0x21, false, 1, 5),
    (12, 0x50, false, 1, 6),
    (4, 0xE, false, 2, 1),
    (8, 0x1D, false, 2, 2),
    (10, 0xE, false, 2, 3),
    (12, 0x51, false, 2, 4),
    (5, 0xD, false, 3, 1),
    (9, 0x23, false, 3, 2),
    (10, 0xD, false, 3, 3),
    (5, 0xC, false, 4, 1),
    (9, 0x22, false, 4, 2),
    (12, 0x52, false, 4, 3),
    (5, 0xB, false, 5, 1),
    (10, 0xC, false, 5, 2),
    (12, 0x53, false, 5, 3),
    (6, 0x13, false, 6, 1),
    (10, 0xB, false, 6, 2),
    (12, 0x54, false, 6, 3),
    (6, 0x12, false, 7, 1),
    (10, 0xA, false, 7, 2),
    (6, 0x11, false, 8, 1),
    (10, 0x9, false, 8, 2),
    (6, 0x10, false, 9, 1),
    (10, 0x8, false, 9, 2),
    (7, 0x16, false, 10, 1),
    (12, 0x55, false, 10, 2),
    (7, 0x15, false, 11, 1),
    (7, 0x14, false, 12, 1),
    (8, 0x1C, false, 13, 1),
    (8, 0x1B, false, 14, 1),
    (9, 0x21, false, 15, 1),
    (9, 0x20, false, 16, 1),
    (9, 0x1F, false, 17, 1),
    (9, 0x1E, false, 18, 1),
    (9, 0x1D, false, 19, 1),
    (9, 0x1C, false, 20, 1),
    (9, 0x1B, false, 21, 1),
    (9, 0x1A, false, 22, 1),
    (11, 0x22, false, 23, 1),
    (11, 0x23, false, 24, 1),
    (12, 0x56, false, 25, 1),
    (12, 0x57, false, 26, 1),
    (4, 0x7, true, 0, 1),
    (9, 0x19, true, 0, 2),
    (11, 0x5, true, 0, 3),
    (6, 0xF, true, 1, 1),
    (11, 0x4, true, 1, 2),
    (6, 0xE, true, 2, 1),
    (6, 0xD, true, 3, 1),
    (6, 0xC, true, 4, 1),
    (7, 0x13, true, 5, 1),
    (7, 0x12, true, 6, 1),
    (7, 0x11, true, 7, 1),
    (7, 0x10, true, 8, 1),
    (8, 0x1A, true, 9, 1),
    (8, 0x19, true, 10, 1),
    (8, 0x18, true, 11, 1),
    (8, 0x17, true, 12, 1),
    (8, 0x16, true, 13, 1),
    (8, 0x15, true, 14, 1),
    (8, 0x14, true, 15, 1),
    (8, 0x13, true, 16, 1),
    (9, 0x18, true, 17, 1),
    (9, 0x17, true, 18, 1),
    (9, 0x16, true, 19, 1),
    (9, 0x15, true, 20, 1),
    (9, 0x14, true, 21, 1),
    (9, 0x13, true, 22, 1),
    (9, 0x12, true, 23, 1),
    (9, 0x11, true, 24, 1),
    (10, 0x7, true, 25, 1),
    (10, 0x6, true, 26, 1),
    (10, 0x5, true, 27, 1),
    (10, 0x4, true, 28, 1),
    (11, 0x24, true, 29, 1),
    (11, 0x25, true, 30, 1),
    (11, 0x26, true, 31, 1),
    (11, 0x27, true, 32, 1),
    (12, 0x58, true, 33, 1),
    (12, 0x59, true, 34, 1),
    (12, 0x5A, true, 35, 1),
    (12, 0x5B, true, 36, 1),
    (12, 0x5C, true, 37, 1),
    (12, 0x5D, true, 38, 1),
    (12, 0x5E, true, 39, 1),
    (12, 0x5F, true, 40, 1),
    (7, 0x3, false, 0, 0), // escape
];

// ============================================================================
// RL 快速查找表 (O(1) 符号解码)
// ============================================================================

/// 快速表位宽: 12 bits 覆盖两张 RL 表的全部码字
const RL_FAST_BITS: u32 = 12;
const RL_FAST_SIZE: usize = 1 << RL_FAST_BITS;

#[derive(Clone, Copy, Default)]
struct RlFastEntry {
    /// 码长 (0 = 无效码字)
    len: u8,
    /// true 表示 escape 码
    escape: bool,
    last: bool,
    run: u8,
    level: u8,
}

/// RL 符号解码结果; 级别为幅值, 符号位由调用方紧随读取
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RlSymbol {
    Coeff { last: bool, run: u8, level: u8 },
    Escape,
}

/// RL 表及其 escape 模式边界数组
pub(super) struct RlTable {
    fast: Box<[RlFastEntry; RL_FAST_SIZE]>,
    /// max_level[last][run]: 该 (last, run) 下表内最大级别
    max_level: [[u8; 64]; 2],
    /// max_run[last][level]: 该 (last, level) 下表内最大游程
    max_run: [[u8; 64]; 2],
}

impl RlTable {
    fn build(table: &[(u8, u16, bool, u8, i8)]) -> Self {
        let mut entries = vec![RlFastEntry::default(); RL_FAST_SIZE];
        let mut max_level = [[0u8; 64]; 2];
        let mut max_run = [[0u8; 64]; 2];

        for &(len, code, last, run, level) in table {
            let escape = run == 0 && level == 0 && !last;
            let padding = RL_FAST_BITS - len as u32;
            let base = (code as usize) << padding;
            for extra in 0..(1usize << padding) {
                entries[base | extra] = RlFastEntry {
                    len,
                    escape,
                    last,
                    run,
                    level: level.unsigned_abs(),
                };
            }
            if !escape {
                let l = last as usize;
                let lev = level.unsigned_abs();
                max_level[l][run as usize] = max_level[l][run as usize].max(lev);
                max_run[l][lev as usize] = max_run[l][lev as usize].max(run);
            }
        }

        // Vec<T> -> Box<[T; N]>
        let boxed_slice = entries.into_boxed_slice();
        // SAFETY: 长度已确保为 RL_FAST_SIZE
        let fast = unsafe {
            let raw = Box::into_raw(boxed_slice) as *mut [RlFastEntry; RL_FAST_SIZE];
            Box::from_raw(raw)
        };

        Self {
            fast,
            max_level,
            max_run,
        }
    }

    /// 解码一个 RL 符号 (不含符号位)
    pub(super) fn decode_symbol(&self, reader: &mut BitReader) -> MeiResult<RlSymbol> {
        let peek = reader.peek_bits(RL_FAST_BITS)?;
        let entry = &self.fast[peek as usize];
        if entry.len == 0 {
            return Err(MeiError::InvalidData(format!(
                "无效的 RL 码字: peek=0x{:03x}, 字节位置 {}",
                peek,
                reader.byte_position(),
            )));
        }
        reader.skip_bits(entry.len as u32)?;
        if entry.escape {
            return Ok(RlSymbol::Escape);
        }
        Ok(RlSymbol::Coeff {
            last: entry.last,
            run: entry.run,
            level: entry.level,
        })
    }

    pub(super) fn max_level(&self, last: bool, run: u8) -> u8 {
        self.max_level[last as usize][(run & 63) as usize]
    }

    pub(super) fn max_run(&self, last: bool, level: u8) -> u8 {
        self.max_run[last as usize][(level & 63) as usize]
    }
}

static INTRA_RL_TABLE: OnceLock<RlTable> = OnceLock::new();
static INTER_RL_TABLE: OnceLock<RlTable> = OnceLock::new();

pub(super) fn intra_rl() -> &'static RlTable {
    INTRA_RL_TABLE.get_or_init(|| RlTable::build(INTRA_RL))
}

pub(super) fn inter_rl() -> &'static RlTable {
    INTER_RL_TABLE.get_or_init(|| RlTable::build(INTER_RL))
}

// ============================================================================
// 线性匹配解码 (头部与宏块模式层码表, 码字少, 不建快速表)
// ============================================================================

/// 逐条匹配 (len, code, value) 形式的码表
fn match_table<T: Copy>(reader: &mut BitReader, table: &[(u8, u16, T)]) -> MeiResult<T> {
    for &(len, code, value) in table {
        let bits = reader.peek_bits(len as u32)?;
        if bits as u16 == code {
            reader.skip_bits(len as u32)?;
            return Ok(value);
        }
    }
    Err(MeiError::InvalidData(format!(
        "无效的 VLC 码字: 字节位置 {}",
        reader.byte_position(),
    )))
}

/// I-VOP MCBPC 解码结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum McbpcI {
    Stuffing,
    Mb { mb_type: MbType, cbp_chroma: u8 },
}

pub(super) fn decode_mcbpc_i(reader: &mut BitReader) -> MeiResult<McbpcI> {
    for &(len, code, class, cbp) in MCBPC_I {
        let bits = reader.peek_bits(len as u32)?;
        if bits as u16 == code {
            reader.skip_bits(len as u32)?;
            return Ok(match class {
                0 => McbpcI::Mb {
                    mb_type: MbType::Intra,
                    cbp_chroma: cbp,
                },
                1 => McbpcI::Mb {
                    mb_type: MbType::IntraQ,
                    cbp_chroma: cbp,
                },
                _ => McbpcI::Stuffing,
            });
        }
    }
    Err(MeiError::InvalidData(format!(
        "无效的 I-VOP MCBPC: 字节位置 {}",
        reader.byte_position(),
    )))
}

/// P/S-VOP MCBPC 解码结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum McbpcP {
    Stuffing,
    Mb { mb_type: MbType, cbp_chroma: u8 },
}

pub(super) fn decode_mcbpc_p(reader: &mut BitReader) -> MeiResult<McbpcP> {
    for &(len, code, class, cbp) in MCBPC_P {
        let bits = reader.peek_bits(len as u32)?;
        if bits as u16 == code {
            reader.skip_bits(len as u32)?;
            let mb_type = match class {
                0 => MbType::Inter,
                1 => MbType::InterQ,
                2 => MbType::Inter4V,
                3 => MbType::Intra,
                4 => MbType::IntraQ,
                _ => return Ok(McbpcP::Stuffing),
            };
            return Ok(McbpcP::Mb {
                mb_type,
                cbp_chroma: cbp,
            });
        }
    }
    Err(MeiError::InvalidData(format!(
        "无效的 P-VOP MCBPC: 字节位置 {}",
        reader.byte_position(),
    )))
}

/// 解码 CBPY (intra 语义; inter 宏块由调用方做 `^ 0xF`)
pub(super) fn decode_cbpy(reader: &mut BitReader) -> MeiResult<u8> {
    match_table(reader, CBPY)
}

/// 解码 intra DC size
pub(super) fn decode_dc_size(reader: &mut BitReader, luma: bool) -> MeiResult<u8> {
    let table = if luma { INTRA_DC_SIZE_Y } else { INTRA_DC_SIZE_UV };
    match_table(reader, table)
}

/// 解码 MVD 幅值 (0..=32)
pub(super) fn decode_mv_magnitude(reader: &mut BitReader) -> MeiResult<u8> {
    match_table(reader, MVD_VLC)
}

/// 解码 sprite 位移的长度前缀 (0..=14)
pub(super) fn decode_sprite_dmv_len(reader: &mut BitReader) -> MeiResult<u8> {
    match_table(reader, SPRITE_DMV_LEN_VLC)
}

/// 解码 B-VOP 宏块模式: "1"=Direct, "01"=Interpolate, "001"=Backward,
/// "0001"=Forward; 四个前导零为非法码字
pub(super) fn decode_b_mb_mode(reader: &mut BitReader) -> MeiResult<BMbMode> {
    for mode_idx in 0..4u8 {
        if reader.read_bit()? != 0 {
            return Ok(match mode_idx {
                0 => BMbMode::Direct,
                1 => BMbMode::Interpolate,
                2 => BMbMode::Backward,
                _ => BMbMode::Forward,
            });
        }
    }
    Err(MeiError::InvalidData(format!(
        "无效的 B 宏块模式码字: 字节位置 {}",
        reader.byte_position(),
    )))
}

/// 解码 DBQUANT: "0"=0, "10"=-2, "11"=+2
pub(super) fn decode_dbquant(reader: &mut BitReader) -> MeiResult<i8> {
    if reader.read_bit()? == 0 {
        return Ok(0);
    }
    Ok(reader.read_bit()? as i8 * 4 - 2)
}

// ============================================================================
// studio profile 码表
// ============================================================================

/// studio DC size VLC (亮度), 19 级
const STUDIO_DC_SIZE_Y: &[(u8, u32, u8)] = &[
    (3, 0b100, 0),
    (2, 0b00, 1),
    (2, 0b01, 2),
    (3, 0b101, 3),
    (3, 0b110, 4),
    (4, 0b1110, 5),
    (5, 0b11110, 6),
    (6, 0b111110, 7),
    (7, 0b1111110, 8),
    (8, 0b11111110, 9),
    (9, 0b111111110, 10),
    (10, 0b1111111110, 11),
    (11, 0b11111111110, 12),
    (12, 0b111111111110, 13),
    (13, 0b1111111111110, 14),
    (14, 0b11111111111110, 15),
    (15, 0b111111111111110, 16),
    (16, 0b1111111111111110, 17),
    (16, 0b1111111111111111, 18),
];

/// studio DC size VLC (色度), 19 级
const STUDIO_DC_SIZE_C: &[(u8, u32, u8)] = &[
    (2, 0b00, 0),
    (2, 0b01, 1),
    (2, 0b10, 2),
    (3, 0b110, 3),
    (4, 0b1110, 4),
    (5, 0b11110, 5),
    (6, 0b111110, 6),
    (7, 0b1111110, 7),
    (8, 0b11111110, 8),
    (9, 0b111111110, 9),
    (10, 0b1111111110, 10),
    (11, 0b11111111110, 11),
    (12, 0b111111111110, 12),
    (13, 0b1111111111110, 13),
    (14, 0b11111111111110, 14),
    (15, 0b111111111111110, 15),
    (16, 0b1111111111111110, 16),
    (17, 0b11111111111111110, 17),
    (17, 0b11111111111111111, 18),
];

/// studio AC 组码长分布: 12 张状态表, 每张覆盖组 0..=21,
/// 码字按 (码长, 组号) 的规范序分配
const STUDIO_AC_GROUP_LENS: [[u8; 22]; 12] = [
    [3, 3, 4, 4, 5, 5, 6, 4, 5, 5, 6, 6, 7, 4, 5, 6, 7, 8, 9, 10, 11, 8],
    [3, 3, 5, 4, 5, 5, 6, 4, 5, 5, 6, 6, 7, 4, 4, 6, 7, 8, 9, 10, 11, 8],
    [3, 3, 4, 5, 5, 5, 6, 4, 5, 5, 6, 6, 7, 4, 5, 5, 7, 8, 9, 10, 11, 8],
    [3, 3, 4, 4, 6, 5, 6, 4, 5, 5, 6, 6, 7, 4, 5, 6, 6, 8, 9, 10, 11, 8],
    [3, 3, 4, 4, 5, 6, 6, 4, 5, 5, 6, 6, 7, 4, 5, 6, 7, 7, 9, 10, 11, 8],
    [3, 3, 4, 4, 5, 5, 7, 4, 5, 5, 6, 6, 7, 4, 5, 6, 7, 8, 8, 10, 11, 8],
    [3, 4, 4, 4, 5, 5, 6, 4, 5, 5, 6, 6, 7, 4, 5, 6, 7, 8, 9, 9, 11, 8],
    [3, 3, 5, 4, 5, 5, 6, 4, 5, 5, 6, 6, 7, 4, 5, 6, 7, 8, 9, 10, 10, 8],
    [3, 3, 4, 5, 5, 5, 6, 4, 5, 5, 6, 6, 7, 3, 5, 6, 7, 8, 9, 10, 11, 8],
    [3, 3, 4, 4, 6, 5, 6, 4, 5, 5, 6, 6, 7, 4, 4, 6, 7, 8, 9, 10, 11, 8],
    [3, 3, 4, 4, 5, 6, 6, 4, 5, 5, 6, 6, 7, 4, 5, 5, 7, 8, 9, 10, 11, 8],
    [3, 3, 4, 4, 5, 5, 7, 4, 5, 5, 6, 6, 7, 4, 5, 6, 6, 8, 9, 10, 11, 8],
];

/// 从码长分布构建规范前缀码 (len, code, group)
fn build_canonical(lens: &[u8; 22]) -> Vec<(u8, u32, u8)> {
    let mut order: Vec<u8> = (0..22).collect();
    order.sort_by_key(|&g| (lens[g as usize], g));

    let mut out = Vec::with_capacity(22);
    let mut code = 0u32;
    let mut prev_len = 0u8;
    for g in order {
        let len = lens[g as usize];
        code <<= len - prev_len;
        out.push((len, code, g));
        code += 1;
        prev_len = len;
    }
    out
}

static STUDIO_AC_TABLES: OnceLock<Vec<Vec<(u8, u32, u8)>>> = OnceLock::new();

fn studio_ac_tables() -> &'static [Vec<(u8, u32, u8)>] {
    STUDIO_AC_TABLES
        .get_or_init(|| STUDIO_AC_GROUP_LENS.iter().map(build_canonical).collect())
}

fn match_table32(reader: &mut BitReader, table: &[(u8, u32, u8)]) -> MeiResult<u8> {
    for &(len, code, value) in table {
        let bits = reader.peek_bits(len as u32)?;
        if bits == code {
            reader.skip_bits(len as u32)?;
            return Ok(value);
        }
    }
    Err(MeiError::InvalidData(format!(
        "无效的 studio 码字: 字节位置 {}",
        reader.byte_position(),
    )))
}

/// 解码 studio DC size (0..=18)
pub(super) fn decode_studio_dc_size(reader: &mut BitReader, luma: bool) -> MeiResult<u8> {
    let table = if luma { STUDIO_DC_SIZE_Y } else { STUDIO_DC_SIZE_C };
    match_table32(reader, table)
}

/// 解码 studio AC 组号 (0..=21), `state` 为状态表序号 0..=11
pub(super) fn decode_studio_ac_group(reader: &mut BitReader, state: usize) -> MeiResult<u8> {
    match_table32(reader, &studio_ac_tables()[state.min(11)])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 构造覆盖所有码长的前缀码校验: 任意两个码字互不为前缀
    fn assert_prefix_free(entries: &[(u8, u32)]) {
        for (i, &(la, ca)) in entries.iter().enumerate() {
            for &(lb, cb) in entries.iter().skip(i + 1) {
                let (short, long, sc, lc) = if la <= lb {
                    (la, lb, ca, cb)
                } else {
                    (lb, la, cb, ca)
                };
                assert_ne!(sc, lc >> (long - short), "前缀冲突");
            }
        }
    }

    #[test]
    fn test_intra_rl_prefix_free() {
        let entries: Vec<(u8, u32)> = INTRA_RL.iter().map(|e| (e.0, e.1 as u32)).collect();
        assert_eq!(entries.len(), 103);
        assert_prefix_free(&entries);
    }

    #[test]
    fn test_inter_rl_prefix_free() {
        let entries: Vec<(u8, u32)> = INTER_RL.iter().map(|e| (e.0, e.1 as u32)).collect();
        assert_eq!(entries.len(), 103);
        assert_prefix_free(&entries);
    }

    #[test]
    fn test_mcbpc_p_inter_shortest() {
        // "1" -> Inter, cbp=0
        let data = [0x80];
        let mut br = BitReader::new(&data);
        assert_eq!(
            decode_mcbpc_p(&mut br).unwrap(),
            McbpcP::Mb {
                mb_type: MbType::Inter,
                cbp_chroma: 0
            }
        );
    }

    #[test]
    fn test_mcbpc_p_stuffing() {
        // "000000001" -> stuffing
        let data = [0b00000000, 0b10000000];
        let mut br = BitReader::new(&data);
        assert_eq!(decode_mcbpc_p(&mut br).unwrap(), McbpcP::Stuffing);
    }

    #[test]
    fn test_mcbpc_i_intra_q() {
        // "0001" -> IntraQ cbp=0
        let data = [0b00010000];
        let mut br = BitReader::new(&data);
        assert_eq!(
            decode_mcbpc_i(&mut br).unwrap(),
            McbpcI::Mb {
                mb_type: MbType::IntraQ,
                cbp_chroma: 0
            }
        );
    }

    #[test]
    fn test_cbpy_all_coded_intra() {
        // "11" -> cbpy=15 (intra 全编码)
        let data = [0b11000000];
        let mut br = BitReader::new(&data);
        assert_eq!(decode_cbpy(&mut br).unwrap(), 15);
    }

    #[test]
    fn test_dc_size_luma_zero() {
        // "011" -> size 0
        let data = [0b01100000];
        let mut br = BitReader::new(&data);
        assert_eq!(decode_dc_size(&mut br, true).unwrap(), 0);
    }

    #[test]
    fn test_mv_magnitude_boundaries() {
        // "1" -> 0
        let mut br = BitReader::new(&[0x80]);
        assert_eq!(decode_mv_magnitude(&mut br).unwrap(), 0);
        // "000000000010" -> 32
        let mut br = BitReader::new(&[0b00000000, 0b00100000]);
        assert_eq!(decode_mv_magnitude(&mut br).unwrap(), 32);
    }

    #[test]
    fn test_rl_escape_symbol() {
        // escape 码 "0000011"
        let data = [0b00000110, 0x00];
        let mut br = BitReader::new(&data);
        assert_eq!(inter_rl().decode_symbol(&mut br).unwrap(), RlSymbol::Escape);
    }

    #[test]
    fn test_rl_first_coeff() {
        // inter "10" -> (last=0, run=0, level=1)
        let data = [0b10000000];
        let mut br = BitReader::new(&data);
        assert_eq!(
            inter_rl().decode_symbol(&mut br).unwrap(),
            RlSymbol::Coeff {
                last: false,
                run: 0,
                level: 1
            }
        );
    }

    #[test]
    fn test_rl_max_level_bounds() {
        // inter 表中 (last=0, run=0) 的最大级别为 12
        assert_eq!(inter_rl().max_level(false, 0), 12);
        // intra 表中 (last=0, run=0) 的最大级别为 27
        assert_eq!(intra_rl().max_level(false, 0), 27);
        // inter 表中 (last=1, level=1) 的最大游程为 40
        assert_eq!(inter_rl().max_run(true, 1), 40);
    }

    #[test]
    fn test_b_mb_mode() {
        let mut br = BitReader::new(&[0b10000000]);
        assert_eq!(decode_b_mb_mode(&mut br).unwrap(), BMbMode::Direct);
        let mut br = BitReader::new(&[0b01000000]);
        assert_eq!(decode_b_mb_mode(&mut br).unwrap(), BMbMode::Interpolate);
        let mut br = BitReader::new(&[0b00010000]);
        assert_eq!(decode_b_mb_mode(&mut br).unwrap(), BMbMode::Forward);
        let mut br = BitReader::new(&[0b00001000]);
        assert!(decode_b_mb_mode(&mut br).is_err());
    }

    #[test]
    fn test_dbquant() {
        let mut br = BitReader::new(&[0b01011000]);
        assert_eq!(decode_dbquant(&mut br).unwrap(), 0);
        assert_eq!(decode_dbquant(&mut br).unwrap(), -2);
        assert_eq!(decode_dbquant(&mut br).unwrap(), 2);
    }

    #[test]
    fn test_sprite_dmv_len() {
        // "00" -> 0 位
        let mut br = BitReader::new(&[0b00000000]);
        assert_eq!(decode_sprite_dmv_len(&mut br).unwrap(), 0);
        // "111111111110" -> 14 位
        let mut br = BitReader::new(&[0xFF, 0b11100000]);
        assert_eq!(decode_sprite_dmv_len(&mut br).unwrap(), 14);
    }

    #[test]
    fn test_studio_canonical_tables_prefix_free() {
        for table in studio_ac_tables() {
            let entries: Vec<(u8, u32)> = table.iter().map(|e| (e.0, e.1)).collect();
            assert_eq!(entries.len(), 22);
            assert_prefix_free(&entries);
        }
    }

    #[test]
    fn test_studio_dc_size_prefix_free() {
        for table in [STUDIO_DC_SIZE_Y, STUDIO_DC_SIZE_C] {
            let entries: Vec<(u8, u32)> = table.iter().map(|e| (e.0, e.1)).collect();
            assert_prefix_free(&entries);
        }
    }
}
