//! 解码器整体行为测试: 完整访问单元经 `decode()` 的端到端路径

use super::tables::DEFAULT_INTRA_MATRIX;
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

/// 已带序列配置的解码器 (等价于 VOL 头部解析完成后的状态)
fn decoder_with_vol() -> Mpeg4Decoder {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut d = Mpeg4Decoder::new();
    d.seq.time_increment_resolution = 25;
    d.seq.time_increment_bits = 5;
    d.seq.quant_precision = 5;
    d.set_dimensions(16, 16);
    d.has_vol = true;
    d
}

/// 单宏块 I-VOP 访问单元: VOP 起始码 + 头部 + 一个 DC-only intra 宏块 +
/// 字节对齐填充
fn single_mb_i_vop() -> Vec<u8> {
    let mut bits = String::new();
    bits.push_str("00000000 00000000 00000001 10110110"); // 00 00 01 B6
    bits.push_str("00"); // I-VOP
    bits.push('0'); // modulo_time_base 结束
    bits.push('1'); // marker
    bits.push_str("00001"); // time_increment = 1
    bits.push('1'); // marker
    bits.push('1'); // vop_coded
    bits.push_str("000"); // intra_dc_vlc_thr
    bits.push_str("00100"); // qscale = 4
    bits.push('1'); // MCBPC: intra, cbp_chroma=0
    bits.push('0'); // ac_pred
    bits.push_str("0011"); // CBPY = 0
    for _ in 0..4 {
        bits.push_str("011"); // 亮度 DC size 0
    }
    for _ in 0..2 {
        bits.push_str("11"); // 色度 DC size 0
    }
    bits.push_str("0111111"); // 对齐填充
    bits_to_bytes(&bits)
}

#[test]
fn test_empty_packet_no_frame() {
    let mut d = Mpeg4Decoder::new();
    assert!(matches!(d.decode(&[]).unwrap(), FrameOutcome::NoFrame));
}

#[test]
fn test_garbage_without_startcode_no_frame() {
    let mut d = Mpeg4Decoder::new();
    assert!(matches!(
        d.decode(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(),
        FrameOutcome::NoFrame
    ));
}

#[test]
fn test_extradata_headers_only() {
    // VOS (profile=0, level=1) + VOL: 176x144, time_res=30000
    let mut bits = String::new();
    bits.push_str("00000000 00000000 00000001 10110000"); // 00 00 01 B0
    bits.push_str("00000001"); // profile_and_level
    bits.push_str("00000000 00000000 00000001 00100000"); // 00 00 01 20
    bits.push('0'); // random_accessible_vol
    bits.push_str("00000001"); // vo_type = simple
    bits.push('0'); // is_object_layer_identifier
    bits.push_str("0001"); // aspect 1:1
    bits.push('0'); // vol_control_parameters
    bits.push_str("00"); // shape = rectangular
    bits.push('1');
    bits.push_str(&format!("{:016b}", 30000u16));
    bits.push('1');
    bits.push('0'); // fixed_vop_rate
    bits.push('1');
    bits.push_str(&format!("{:013b}", 176u16));
    bits.push('1');
    bits.push_str(&format!("{:013b}", 144u16));
    bits.push('1');
    bits.push('0'); // interlaced=0
    bits.push('1'); // obmc_disable
    bits.push('0'); // sprite_usage
    bits.push('0'); // not_8_bit
    bits.push('0'); // quant_type
    bits.push('1'); // complexity_estimation_disable
    bits.push('1'); // resync_marker_disable
    bits.push('0'); // data_partitioned
    bits.push('0'); // scalability
    let data = bits_to_bytes(&bits);

    let mut d = Mpeg4Decoder::new();
    assert!(matches!(d.decode(&data).unwrap(), FrameOutcome::NoFrame));
    assert!(d.has_vol);
    assert_eq!(d.profile_level(), (0, 1));
    assert_eq!(d.sequence().width, 176);
    assert_eq!(d.sequence().height, 144);
    assert_eq!(d.mb_width, 11);
    assert_eq!(d.mb_height, 9);
}

#[test]
fn test_single_intra_frame() {
    let data = single_mb_i_vop();
    let mut d = decoder_with_vol();
    let frame = match d.decode(&data).unwrap() {
        FrameOutcome::Decoded(frame) => frame,
        other => panic!("期待解出一帧, 实际 {:?}", other),
    };
    assert_eq!(frame.picture_type, PictureType::I);
    assert_eq!(frame.pts, 1);
    assert_eq!(frame.mb_width, 1);
    assert_eq!(frame.mb_height, 1);
    assert_eq!(frame.mb_decoded, 1);
    assert_eq!(frame.mb_errored, 0);
    assert_eq!(frame.macroblocks.len(), 1);
    let mb = &frame.macroblocks[0];
    assert_eq!(mb.mb_type, MbType::Intra);
    assert_eq!(mb.quant, 4);
    assert!(!mb.in_error);
    // DC 预测初值 1024 按步长 8 折算, 差值 0
    assert_eq!(mb.blocks[0][0], 128);
}

#[test]
fn test_clean_frame_feeds_no_padding_autodetect() {
    let data = single_mb_i_vop();
    let mut d = decoder_with_vol();
    d.decode(&data).unwrap();
    // 帧尾无多余填充, 评分未跌破阈值, 自动检测判定 NO_PADDING
    assert!(d.bugs.contains(BugFlags::NO_PADDING));
}

#[test]
fn test_vop_not_coded_skipped() {
    let mut bits = String::new();
    bits.push_str("00000000 00000000 00000001 10110110");
    bits.push_str("00"); // I-VOP
    bits.push('0');
    bits.push('1');
    bits.push_str("00001");
    bits.push('1');
    bits.push('0'); // vop_coded = 0
    let data = bits_to_bytes(&bits);
    let mut d = decoder_with_vol();
    assert!(matches!(
        d.decode(&data).unwrap(),
        FrameOutcome::Skipped(SkipReason::NotCoded)
    ));
}

#[test]
fn test_one_byte_xvid_trailer_skipped() {
    let mut d = Mpeg4Decoder::new();
    d.encoder.xvid_build = 50;
    assert!(matches!(
        d.decode(&[0x7F]).unwrap(),
        FrameOutcome::Skipped(SkipReason::PackedTrailer)
    ));
}

#[test]
fn test_qmp4_trailer_skipped() {
    let mut d = Mpeg4Decoder::new();
    d.set_codec_tag(*b"QMP4");
    assert!(matches!(
        d.decode(&[0x00]).unwrap(),
        FrameOutcome::Skipped(SkipReason::PackedTrailer)
    ));
}

#[test]
fn test_packed_remainder_stash() {
    let mut d = Mpeg4Decoder::new();
    d.encoder.divx_packed = true;

    // 后置 VOP 类型为 B (首两位 10): 缓存
    let mut data = vec![0u8; 8];
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0xB6, 0x80, 0x00, 0x00, 0x00]);
    d.stash_packed_remainder(&data, 0);
    assert!(d.packed_pending.is_some());

    // 后置 VOP 类型为 P (首两位 01): 不缓存
    d.packed_pending = None;
    let mut data = vec![0u8; 8];
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0xB6, 0x40, 0x00, 0x00, 0x00]);
    d.stash_packed_remainder(&data, 0);
    assert!(d.packed_pending.is_none());
}

#[test]
fn test_packed_pending_decoded_before_trailer() {
    let mut d = decoder_with_vol();
    d.encoder.divx_packed = true;
    d.packed_pending = Some(single_mb_i_vop());

    // 本包是无起始码的占位数据, 缓存的 VOP 先解
    let outcome = d.decode(&[0x7F; 20]).unwrap();
    match outcome {
        FrameOutcome::Decoded(frame) => assert_eq!(frame.picture_type, PictureType::I),
        other => panic!("期待解出缓存帧, 实际 {:?}", other),
    }
    assert!(d.packed_pending.is_none());
}

#[test]
fn test_packed_pending_dropped_on_vos() {
    let mut d = Mpeg4Decoder::new();
    d.encoder.divx_packed = true;
    d.packed_pending = Some(vec![0xAA; 16]);

    // 新段以 VOS 起始码开头, 缓存必须废弃而不是被解码
    let data = [0x00, 0x00, 0x01, 0xB0, 0x01];
    assert!(matches!(d.decode(&data).unwrap(), FrameOutcome::NoFrame));
    assert!(d.packed_pending.is_none());
    assert_eq!(d.profile_level(), (0, 1));
}

#[test]
fn test_set_dimensions_rebuilds_tables() {
    let mut d = Mpeg4Decoder::new();
    d.set_dimensions(64, 48);
    assert_eq!(d.mb_width, 4);
    assert_eq!(d.mb_height, 3);
    assert_eq!(d.mbs.len(), 12);
    assert_eq!(d.mv_cache.len(), 12);
    assert_eq!(d.mbskip_table.len(), 12);

    // 非 16 倍数的尺寸向上取整
    d.set_dimensions(17, 17);
    assert_eq!(d.mb_width, 2);
    assert_eq!(d.mb_height, 2);
}

#[test]
fn test_set_qscale_clamps() {
    let mut d = Mpeg4Decoder::new();
    d.set_qscale(0);
    assert_eq!(d.qscale, 1);
    d.set_qscale(40);
    assert_eq!(d.qscale, 31);
    d.set_qscale(8);
    assert_eq!(d.qscale, 8);
    assert_eq!(d.y_dc_scale, 16);
    assert_eq!(d.c_dc_scale, 10);
}

#[test]
fn test_default_matrices_identity_permutation() {
    let mut d = Mpeg4Decoder::new();
    d.load_default_matrices();
    assert_eq!(d.intra_matrix, DEFAULT_INTRA_MATRIX);
    assert_eq!(d.chroma_intra_matrix, DEFAULT_INTRA_MATRIX);
    assert_eq!(d.inter_matrix[0], 16);
}

#[test]
fn test_studio_vop_requires_vol() {
    let mut d = Mpeg4Decoder::new();
    d.seq.studio_profile = true;
    let data = [0x00, 0x00, 0x01, 0xB6, 0x00, 0x00, 0x00, 0x00];
    assert!(d.decode(&data).is_err());
}
