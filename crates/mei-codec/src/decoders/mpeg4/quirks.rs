//! 编码器识别与历史缺陷兼容
//!
//! user_data 中的编码器签名 (DivX/XviD/lavc) 与容器 codec tag 共同决定
//! 一组兼容标志, 解码各环节按位查询以复现对应编码器的行为.

use log::{debug, warn};

use super::Mpeg4Decoder;
use super::types::{BugFlags, EncoderInfo};

/// 从字节流起始解析十进制整数, 返回 (值, 消耗字节数)
fn parse_int(s: &[u8]) -> Option<(i32, usize)> {
    let end = s.iter().position(|b| !b.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&s[..end])
        .ok()?
        .parse::<i32>()
        .ok()
        .map(|v| (v, end))
}

/// 识别 user_data 中的编码器签名
pub(super) fn parse_user_data(encoder: &mut EncoderInfo, buf: &[u8]) {
    // DivX: "DivX<ver>Build<build>[p]" 或 "DivX<ver>b<build>[p]"
    if let Some(rest) = buf.strip_prefix(b"DivX") {
        if let Some((version, n)) = parse_int(rest) {
            let rest = &rest[n..];
            let rest = rest
                .strip_prefix(b"Build")
                .or_else(|| rest.strip_prefix(b"b"));
            if let Some(rest) = rest {
                if let Some((build, n)) = parse_int(rest) {
                    encoder.divx_version = version;
                    encoder.divx_build = build;
                    encoder.divx_packed = rest.get(n) == Some(&b'p');
                    debug!(
                        "编码器: DivX {} build {}{}",
                        version,
                        build,
                        if encoder.divx_packed { " (packed)" } else { "" }
                    );
                }
            }
        }
    }

    // libavcodec: "FFmpe...b<build>", "FFmpeg v<a>.<b>.<c> / libavcodec build: <n>",
    // "Lavc<a>.<b>.<c>", 或裸 "ffmpeg"
    let mut lavc_build = None;
    if let Some(rest) = buf.strip_prefix(b"FFmpe") {
        if let Some(pos) = rest.iter().position(|&b| b == b'b') {
            if let Some((build, _)) = parse_int(&rest[pos + 1..]) {
                lavc_build = Some(build);
            }
        }
        if lavc_build.is_none() {
            if let Some(pos) = buf.windows(7).position(|w| w == b"build: ") {
                if let Some((build, _)) = parse_int(&buf[pos + 7..]) {
                    lavc_build = Some(build);
                }
            }
        }
    } else if let Some(rest) = buf.strip_prefix(b"Lavc") {
        let mut parts = [0i32; 3];
        let mut s = rest;
        let mut ok = true;
        for (i, part) in parts.iter_mut().enumerate() {
            match parse_int(s) {
                Some((v, n)) => {
                    *part = v;
                    s = &s[n..];
                    if i < 2 {
                        match s.strip_prefix(b".") {
                            Some(next) => s = next,
                            None => {
                                ok = false;
                                break;
                            }
                        }
                    }
                }
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            if parts.iter().any(|&v| v > 0xFF) {
                warn!(
                    "未知的 Lavc 版本串 {}.{}.{}, 子版本截断到 8 位",
                    parts[0], parts[1], parts[2]
                );
            }
            lavc_build =
                Some(((parts[0] & 0xFF) << 16) + ((parts[1] & 0xFF) << 8) + (parts[2] & 0xFF));
        }
    } else if buf == b"ffmpeg" {
        lavc_build = Some(4600);
    }
    if let Some(build) = lavc_build {
        encoder.lavc_build = build;
        debug!("编码器: libavcodec build {}", build);
    }

    // XviD: "XviD<build>"
    if let Some(rest) = buf.strip_prefix(b"XviD") {
        if let Some((build, _)) = parse_int(rest) {
            encoder.xvid_build = build;
            debug!("编码器: XviD build {}", build);
        }
    }
}

/// 按旧/新置换关系重排量化矩阵 (纯变换, 在检出点一次性调用)
pub(super) fn repermute_matrix(matrix: &mut [u16; 64], new_perm: &[u8; 64], old_perm: &[u8; 64]) {
    let tmp = *matrix;
    for i in 0..64 {
        matrix[new_perm[i] as usize] = tmp[old_perm[i] as usize];
    }
}

impl Mpeg4Decoder {
    /// 根据识别出的编码器确定兼容标志
    ///
    /// 每帧头部解析完成后调用; 签名缺席时回退到 codec tag 推断.
    pub(super) fn resolve_workarounds(&mut self) {
        let enc = &mut self.encoder;

        if enc.xvid_build == -1 && enc.divx_version == -1 && enc.lavc_build == -1 {
            if matches!(&self.codec_tag, b"XVID" | b"XVIX" | b"RMP4" | b"ZMP4" | b"SIPP") {
                enc.xvid_build = 0;
            }
        }

        if enc.xvid_build == -1 && enc.divx_version == -1 && enc.lavc_build == -1 {
            // DivX 4 在未打标的流中用 vo_type/vol_control 轮廓识别
            if &self.codec_tag == b"DIVX"
                && self.seq.vo_type == 0
                && !self.seq.vol_control_parameters
            {
                enc.divx_version = 400;
            }
        }

        if enc.xvid_build >= 0 && enc.divx_version >= 0 {
            enc.divx_version = -1;
            enc.divx_build = -1;
        }

        if self.bugs.contains(BugFlags::AUTODETECT) {
            let mut bugs = BugFlags::AUTODETECT;

            if &self.codec_tag == b"XVIX" {
                bugs |= BugFlags::XVID_ILACE;
            }
            if &self.codec_tag == b"UMP4" {
                bugs |= BugFlags::UMP4;
            }

            if enc.divx_version >= 500 && enc.divx_build < 1814 {
                bugs |= BugFlags::QPEL_CHROMA;
            }
            if enc.divx_version > 502 && enc.divx_build < 1814 {
                bugs |= BugFlags::QPEL_CHROMA2;
            }

            // 负值经 u32 比较自然落空
            if (enc.xvid_build as u32) <= 3 {
                self.padding_bug_score = 256 * 256 * 256 * 64;
            }
            if (enc.xvid_build as u32) <= 1 {
                bugs |= BugFlags::QPEL_CHROMA;
            }
            if (enc.xvid_build as u32) <= 12 {
                bugs |= BugFlags::EDGE;
            }
            if (enc.xvid_build as u32) <= 32 {
                bugs |= BugFlags::DC_CLIP;
            }

            if (enc.lavc_build as u32) < 4653 {
                bugs |= BugFlags::STD_QPEL;
            }
            if (enc.lavc_build as u32) < 4655 {
                bugs |= BugFlags::DIRECT_BLOCKSIZE;
            }
            if (enc.lavc_build as u32) < 4670 {
                bugs |= BugFlags::EDGE;
            }
            if (enc.lavc_build as u32) <= 4712 {
                bugs |= BugFlags::DC_CLIP;
            }
            if (enc.lavc_build & 0xFF) >= 100
                && enc.lavc_build > 3621476
                && enc.lavc_build < 3752552
                && !(3752037..=3752191).contains(&enc.lavc_build)
            {
                bugs |= BugFlags::IEDGE;
            }

            if enc.divx_version >= 0 {
                bugs |= BugFlags::DIRECT_BLOCKSIZE | BugFlags::HPEL_CHROMA;
            }
            if enc.divx_version == 501 && enc.divx_build == 20020416 {
                self.padding_bug_score = 256 * 256 * 256 * 64;
            }
            if (enc.divx_version as u32) < 500 {
                bugs |= BugFlags::EDGE;
            }

            self.bugs = bugs;
        }

        if self.encoder.xvid_build >= 0 && !self.seq.studio_profile && !self.xvid_idct_active {
            self.switch_to_xvid_idct();
        }

        debug!(
            "兼容标志: {:?}, lavc={}, xvid={}, divx={}/{}",
            self.bugs,
            self.encoder.lavc_build,
            self.encoder.xvid_build,
            self.encoder.divx_version,
            self.encoder.divx_build,
        );
    }

    /// 切换到 XviD 的系数排布, 已装载的量化矩阵按新旧置换重排
    fn switch_to_xvid_idct(&mut self) {
        let old_perm = self.idct_permutation;
        let new_perm = Self::xvid_permutation();
        repermute_matrix(&mut self.intra_matrix, &new_perm, &old_perm);
        repermute_matrix(&mut self.inter_matrix, &new_perm, &old_perm);
        self.idct_permutation = new_perm;
        self.xvid_idct_active = true;
    }

    /// XviD 的系数排布: 软件路径下与默认排布同为自然顺序
    fn xvid_permutation() -> [u8; 64] {
        std::array::from_fn(|i| i as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Mpeg4Decoder;
    use super::super::types::{BugFlags, EncoderInfo};
    use super::{parse_user_data, repermute_matrix};

    #[test]
    fn test_parse_divx_packed() {
        let mut enc = EncoderInfo::default();
        parse_user_data(&mut enc, b"DivX503Build1513p");
        assert_eq!(enc.divx_version, 503);
        assert_eq!(enc.divx_build, 1513);
        assert!(enc.divx_packed);
    }

    #[test]
    fn test_parse_divx_short_form() {
        let mut enc = EncoderInfo::default();
        parse_user_data(&mut enc, b"DivX500b413");
        assert_eq!(enc.divx_version, 500);
        assert_eq!(enc.divx_build, 413);
        assert!(!enc.divx_packed);
    }

    #[test]
    fn test_parse_xvid() {
        let mut enc = EncoderInfo::default();
        parse_user_data(&mut enc, b"XviD0030");
        assert_eq!(enc.xvid_build, 30);
    }

    #[test]
    fn test_parse_lavc_version_triplet() {
        let mut enc = EncoderInfo::default();
        parse_user_data(&mut enc, b"Lavc58.54.100");
        assert_eq!(enc.lavc_build, (58 << 16) + (54 << 8) + 100);
    }

    #[test]
    fn test_parse_bare_ffmpeg() {
        let mut enc = EncoderInfo::default();
        parse_user_data(&mut enc, b"ffmpeg");
        assert_eq!(enc.lavc_build, 4600);
    }

    #[test]
    fn test_parse_unrelated_data() {
        let mut enc = EncoderInfo::default();
        parse_user_data(&mut enc, b"encoded by some tool");
        assert_eq!(enc.divx_version, -1);
        assert_eq!(enc.xvid_build, -1);
        assert_eq!(enc.lavc_build, -1);
    }

    #[test]
    fn test_xvid_tag_fallback() {
        let mut decoder = Mpeg4Decoder::new();
        decoder.set_codec_tag(*b"XVID");
        decoder.resolve_workarounds();
        assert_eq!(decoder.encoder.xvid_build, 0);
        // xvid build 0 <= 32: DC_CLIP 与 EDGE 均应置位
        assert!(decoder.bugs.contains(BugFlags::DC_CLIP));
        assert!(decoder.bugs.contains(BugFlags::EDGE));
        assert!(decoder.bugs.contains(BugFlags::QPEL_CHROMA));
    }

    #[test]
    fn test_xvid_wins_over_divx() {
        let mut decoder = Mpeg4Decoder::new();
        decoder.encoder.xvid_build = 50;
        decoder.encoder.divx_version = 500;
        decoder.encoder.divx_build = 1000;
        decoder.resolve_workarounds();
        assert_eq!(decoder.encoder.divx_version, -1);
        assert_eq!(decoder.encoder.divx_build, -1);
    }

    #[test]
    fn test_old_divx_edge_bug() {
        let mut decoder = Mpeg4Decoder::new();
        decoder.encoder.divx_version = 400;
        decoder.resolve_workarounds();
        assert!(decoder.bugs.contains(BugFlags::EDGE));
        assert!(decoder.bugs.contains(BugFlags::DIRECT_BLOCKSIZE));
        assert!(decoder.bugs.contains(BugFlags::HPEL_CHROMA));
        assert!(!decoder.bugs.contains(BugFlags::QPEL_CHROMA));
    }

    #[test]
    fn test_repermute_roundtrip() {
        let mut matrix = [0u16; 64];
        for (i, m) in matrix.iter_mut().enumerate() {
            *m = i as u16;
        }
        let identity: [u8; 64] = std::array::from_fn(|i| i as u8);
        let reversed: [u8; 64] = std::array::from_fn(|i| 63 - i as u8);
        repermute_matrix(&mut matrix, &reversed, &identity);
        assert_eq!(matrix[63], 0);
        assert_eq!(matrix[0], 63);
        // 反向重排应复原
        repermute_matrix(&mut matrix, &identity, &reversed);
        assert_eq!(matrix[0], 0);
        assert_eq!(matrix[63], 63);
    }
}
