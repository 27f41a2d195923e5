//! 比特流读取器.
//!
//! 提供从字节缓冲区中按位读取数据的能力, 是码流解析的基础设施.
//!
//! 按大端位序读取 (MSB first), 这是多媒体编解码器中最常用的位序.

use crate::{MeiError, MeiResult};

/// 比特流读取器
///
/// 从字节缓冲区中按位读取数据, 使用大端位序 (MSB first).
///
/// # 示例
/// ```
/// use mei_core::bitreader::BitReader;
///
/// let data = [0b10110001, 0b01010101];
/// let mut br = BitReader::new(&data);
/// assert_eq!(br.read_bits(4).unwrap(), 0b1011);
/// assert_eq!(br.read_bits(4).unwrap(), 0b0001);
/// assert_eq!(br.read_bits(8).unwrap(), 0b01010101);
/// ```
pub struct BitReader<'a> {
    /// 源数据
    data: &'a [u8],
    /// 当前字节索引
    byte_pos: usize,
    /// 当前字节中的位位置 (0-7, 0 表示最高位)
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    /// 创建新的比特流读取器
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// 获取已读取的总位数 (即当前绝对位位置)
    pub fn bits_read(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }

    /// 设置当前绝对位位置
    ///
    /// 用于解析过程中的回退 (例如 VOL 头中复杂度估计字段的自校正启发式).
    pub fn set_bit_position(&mut self, pos: usize) -> MeiResult<()> {
        if pos > self.data.len() * 8 {
            return Err(MeiError::InvalidArgument(format!(
                "set_bit_position: 位置 {} 超出数据范围",
                pos,
            )));
        }
        self.byte_pos = pos / 8;
        self.bit_pos = (pos % 8) as u8;
        Ok(())
    }

    /// 获取剩余可读位数
    pub fn bits_left(&self) -> usize {
        if self.byte_pos >= self.data.len() {
            return 0;
        }
        (self.data.len() - self.byte_pos) * 8 - self.bit_pos as usize
    }

    /// 是否已到达末尾
    pub fn is_eof(&self) -> bool {
        self.bits_left() == 0
    }

    /// 读取 1 个位
    pub fn read_bit(&mut self) -> MeiResult<u32> {
        if self.byte_pos >= self.data.len() {
            return Err(MeiError::Eof);
        }

        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos >= 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }

        Ok(u32::from(bit))
    }

    /// 读取 N 个位 (最多 32 位)
    ///
    /// 按大端位序读取, 返回值的低 N 位有效.
    pub fn read_bits(&mut self, n: u32) -> MeiResult<u32> {
        if n == 0 {
            return Ok(0);
        }
        if n > 32 {
            return Err(MeiError::InvalidArgument(format!(
                "read_bits: n={} 超过 32 位",
                n,
            )));
        }
        if (n as usize) > self.bits_left() {
            return Err(MeiError::Eof);
        }

        let mut result: u32 = 0;
        let mut remaining = n;

        while remaining > 0 {
            let available = 8 - self.bit_pos as u32;
            let to_read = remaining.min(available);

            // 从当前字节中提取位
            let shift = available - to_read;
            let mask = ((1u32 << to_read) - 1) as u8;
            let bits = (self.data[self.byte_pos] >> shift) & mask;

            result = (result << to_read) | u32::from(bits);

            self.bit_pos += to_read as u8;
            if self.bit_pos >= 8 {
                self.bit_pos = 0;
                self.byte_pos += 1;
            }
            remaining -= to_read;
        }

        Ok(result)
    }

    /// 读取有符号整数 (二进制补码)
    pub fn read_bits_signed(&mut self, n: u32) -> MeiResult<i32> {
        let val = self.read_bits(n)?;
        if n == 0 {
            return Ok(0);
        }
        // n == 32 时, val 的全部 32 位有效, 直接转换为 i32 (二进制补码)
        if n >= 32 {
            return Ok(val as i32);
        }
        // 符号扩展: 若最高有效位为 1, 则填充高位
        if (val >> (n - 1)) & 1 != 0 {
            Ok(val as i32 | !((1i32 << n) - 1))
        } else {
            Ok(val as i32)
        }
    }

    /// 读取偏移二进制编码的有符号整数 (xbits)
    ///
    /// MPEG 系标准中 DC 差分与 sprite 位移使用的编码: 最高位为 1 表示正数,
    /// 直接取值; 最高位为 0 表示负数, 值为 `v - (1 << n) + 1`.
    pub fn read_xbits(&mut self, n: u32) -> MeiResult<i32> {
        if n == 0 {
            return Ok(0);
        }
        let val = self.read_bits(n)?;
        if (val >> (n - 1)) & 1 != 0 {
            Ok(val as i32)
        } else {
            Ok(val as i32 - (1i32 << n) + 1)
        }
    }

    /// 读取一元编码值 (unary code)
    ///
    /// 计算连续出现的 `stop_bit` 的反面的位数, 直到遇到 `stop_bit`.
    ///
    /// 例如, `read_unary(1)` 从 `0001...` 中读取得到 3 (三个 0 后跟一个 1).
    pub fn read_unary(&mut self, stop_bit: u32) -> MeiResult<u32> {
        let stop = stop_bit & 1;
        let mut count = 0u32;
        loop {
            let bit = self.read_bit()?;
            if bit == stop {
                return Ok(count);
            }
            count += 1;
        }
    }

    /// 窥视 N 个位 (不移动位置)
    ///
    /// 数据不足 N 位时以 0 补齐低位, 与码流尾部的 resync 探测约定一致.
    pub fn peek_bits(&mut self, n: u32) -> MeiResult<u32> {
        let saved_byte = self.byte_pos;
        let saved_bit = self.bit_pos;
        let left = self.bits_left() as u32;
        let result = if left >= n {
            self.read_bits(n)
        } else if n <= 32 {
            self.read_bits(left).map(|v| v << (n - left))
        } else {
            Err(MeiError::InvalidArgument(format!(
                "peek_bits: n={} 超过 32 位",
                n,
            )))
        };
        self.byte_pos = saved_byte;
        self.bit_pos = saved_bit;
        result
    }

    /// 跳过 N 个位
    pub fn skip_bits(&mut self, n: u32) -> MeiResult<()> {
        if (n as usize) > self.bits_left() {
            return Err(MeiError::Eof);
        }

        let total_bits = self.bit_pos as u32 + n;
        self.byte_pos += (total_bits / 8) as usize;
        self.bit_pos = (total_bits % 8) as u8;

        Ok(())
    }

    /// 对齐到下一个字节边界
    ///
    /// 如果当前已在字节边界, 则不做任何事.
    pub fn align_to_byte(&mut self) {
        if self.bit_pos > 0 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
    }

    /// 获取当前字节位置
    pub fn byte_position(&self) -> usize {
        self.byte_pos
    }

    /// 从当前位置读取原始字节切片
    ///
    /// 仅在字节对齐时可用.
    pub fn read_bytes(&mut self, n: usize) -> MeiResult<&'a [u8]> {
        if self.bit_pos != 0 {
            return Err(MeiError::InvalidArgument("read_bytes 需要字节对齐".into()));
        }

        let end = self.byte_pos + n;
        if end > self.data.len() {
            return Err(MeiError::Eof);
        }

        let slice = &self.data[self.byte_pos..end];
        self.byte_pos = end;
        Ok(slice)
    }

    /// 获取底层数据的引用
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits_basic() {
        let data = [0b10110001, 0b01010101];
        let mut br = BitReader::new(&data);

        assert_eq!(br.read_bits(1).unwrap(), 1);
        assert_eq!(br.read_bits(1).unwrap(), 0);
        assert_eq!(br.read_bits(2).unwrap(), 0b11);
        assert_eq!(br.read_bits(4).unwrap(), 0b0001);
        assert_eq!(br.read_bits(8).unwrap(), 0b01010101);

        assert!(br.is_eof());
    }

    #[test]
    fn test_read_bits_32_bit() {
        let data = [0xFF, 0x00, 0xFF, 0x00];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bits(32).unwrap(), 0xFF00FF00);
    }

    #[test]
    fn test_read_bits_signed() {
        let data = [0b11111000]; // -1 in 5 bits = 0b11111
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bits_signed(5).unwrap(), -1);

        let data2 = [0b01010000]; // 10 in 5 bits = 0b01010
        let mut br2 = BitReader::new(&data2);
        assert_eq!(br2.read_bits_signed(5).unwrap(), 10);
    }

    #[test]
    fn test_read_xbits() {
        // 3 位, 最高位 1 -> 正数, 0b101 = 5
        let data = [0b10100000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_xbits(3).unwrap(), 5);

        // 3 位, 最高位 0 -> 负数, 0b010 = 2 - 8 + 1 = -5
        let data2 = [0b01000000];
        let mut br2 = BitReader::new(&data2);
        assert_eq!(br2.read_xbits(3).unwrap(), -5);

        // 1 位: 0 表示 0 - 2 + 1 = -1, 1 表示 1
        let data3 = [0b01000000];
        let mut br3 = BitReader::new(&data3);
        assert_eq!(br3.read_xbits(1).unwrap(), -1);
        assert_eq!(br3.read_xbits(1).unwrap(), 1);
    }

    #[test]
    fn test_read_unary() {
        // 0001... -> unary(1) = 3
        let data = [0b00010000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_unary(1).unwrap(), 3);

        // 1110... -> unary(0) = 3
        let data2 = [0b11100000];
        let mut br2 = BitReader::new(&data2);
        assert_eq!(br2.read_unary(0).unwrap(), 3);
    }

    #[test]
    fn test_peek_bits() {
        let data = [0b10110001];
        let mut br = BitReader::new(&data);

        assert_eq!(br.peek_bits(4).unwrap(), 0b1011);
        assert_eq!(br.peek_bits(4).unwrap(), 0b1011); // 不移动
        assert_eq!(br.read_bits(4).unwrap(), 0b1011); // 现在移动了
        assert_eq!(br.peek_bits(4).unwrap(), 0b0001);
    }

    #[test]
    fn test_peek_bits_past_end() {
        let data = [0xA0];
        let mut br = BitReader::new(&data);
        // 仅剩 8 位时窥视 16 位, 低 8 位补 0
        assert_eq!(br.peek_bits(16).unwrap(), 0xA000);
        assert_eq!(br.read_bits(8).unwrap(), 0xA0);
    }

    #[test]
    fn test_skip_bits() {
        let data = [0b10110001, 0b01010101];
        let mut br = BitReader::new(&data);

        br.skip_bits(4).unwrap();
        assert_eq!(br.read_bits(4).unwrap(), 0b0001);
        br.skip_bits(4).unwrap();
        assert_eq!(br.read_bits(4).unwrap(), 0b0101);
    }

    #[test]
    fn test_align_to_byte() {
        let data = [0b10110001, 0b01010101];
        let mut br = BitReader::new(&data);

        br.read_bits(3).unwrap();
        br.align_to_byte();
        assert_eq!(br.byte_position(), 1);
        assert_eq!(br.read_bits(8).unwrap(), 0b01010101);
    }

    #[test]
    fn test_set_bit_position() {
        let data = [0b10110001, 0b01010101];
        let mut br = BitReader::new(&data);

        br.read_bits(10).unwrap();
        let pos = br.bits_read();
        br.read_bits(3).unwrap();
        br.set_bit_position(pos).unwrap();
        assert_eq!(br.bits_read(), 10);
        assert_eq!(br.read_bits(3).unwrap(), 0b010);
        assert!(br.set_bit_position(100).is_err());
    }

    #[test]
    fn test_bits_left() {
        let data = [0x00, 0x00];
        let mut br = BitReader::new(&data);

        assert_eq!(br.bits_left(), 16);
        br.read_bits(5).unwrap();
        assert_eq!(br.bits_left(), 11);
        br.read_bits(11).unwrap();
        assert_eq!(br.bits_left(), 0);
        assert!(br.is_eof());
    }

    #[test]
    fn test_read_bytes() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut br = BitReader::new(&data);

        let bytes = br.read_bytes(2).unwrap();
        assert_eq!(bytes, &[0x01, 0x02]);
        let bytes = br.read_bytes(2).unwrap();
        assert_eq!(bytes, &[0x03, 0x04]);
    }

    #[test]
    fn test_eof_error() {
        let data = [0x00];
        let mut br = BitReader::new(&data);

        br.read_bits(8).unwrap();
        assert!(br.read_bits(1).is_err());
    }
}
