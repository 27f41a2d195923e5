//! 序列层头部解析: VOS, Visual Object, GOP, user_data, VOL
//!
//! VOL 头部产生持久的 `SequenceConfig`; 其余头部只更新编码器识别信息
//! 与时间基. studio profile 的 VOL 变体在 studio.rs 中解析.

use log::{debug, error, info, warn};
use mei_core::{BitReader, MeiError, MeiResult};

use super::Mpeg4Decoder;
use super::quirks;
use super::tables::ZIGZAG_SCAN;
use super::types::{SpriteMode, VolShape};

/// video_object_type_indication 取值
pub(super) const VO_TYPE_SIMPLE: u8 = 1;
const VO_TYPE_SIMPLE_STUDIO: u8 = 14;
const VO_TYPE_CORE_STUDIO: u8 = 15;
pub(super) const VO_TYPE_ADV_SIMPLE: u8 = 17;

/// profile_and_level_indication 的 profile 半字节: simple studio
const PROFILE_SIMPLE_STUDIO: u32 = 14;

/// 像素宽高比预设表
const PIXEL_ASPECT: [(u8, u8); 6] = [(0, 1), (1, 1), (12, 11), (10, 11), (16, 11), (40, 33)];

/// 读取 marker 位, 为 0 时告警但不中断
pub(super) fn check_marker(reader: &mut BitReader, what: &str) -> MeiResult<bool> {
    let bit = reader.read_bit()?;
    if bit != 1 {
        warn!("marker 位缺失: {}", what);
    }
    Ok(bit == 1)
}

impl Mpeg4Decoder {
    /// 解析 VOS 头部 (profile_and_level_indication)
    pub(super) fn decode_vos_header(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        let profile = reader.read_bits(4)?;
        let mut level = reader.read_bits(4)?;
        if profile == 0 && level == 8 {
            // simple profile 的保留 level 码点
            level = 0;
        }
        self.profile = profile as i32;
        self.level = level as i32;
        if profile == PROFILE_SIMPLE_STUDIO && (1..9).contains(&level) {
            self.seq.studio_profile = true;
        }
        debug!("VOS: profile={}, level={}", profile, level);
        Ok(())
    }

    /// 解析 Visual Object 头部
    pub(super) fn decode_visual_object(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        if reader.read_bit()? == 1 {
            // is_visual_object_identifier
            reader.skip_bits(4 + 3)?;
        }
        let visual_object_type = reader.read_bits(4)?;
        // 1 = video, 2 = still texture
        if visual_object_type == 1 || visual_object_type == 2 {
            if reader.read_bit()? == 1 {
                // video_signal_type
                reader.skip_bits(3)?; // video_format
                self.video_range = Some(reader.read_bit()? == 1);
                if reader.read_bit()? == 1 {
                    // colour_description
                    let primaries = reader.read_bits(8)? as u8;
                    let transfer = reader.read_bits(8)? as u8;
                    let matrix = reader.read_bits(8)? as u8;
                    self.color_description = Some((primaries, transfer, matrix));
                }
            }
        }
        Ok(())
    }

    /// 解析 GOP 头部 (时间码与 closed/broken 标志)
    pub(super) fn decode_gop_header(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        if reader.peek_bits(23)? == 0 {
            warn!("GOP 头部过早结束");
        }
        let hours = reader.read_bits(5)? as i64;
        let minutes = reader.read_bits(6)? as i64;
        reader.read_bit()?; // marker
        let seconds = reader.read_bits(6)? as i64;
        self.time_base = seconds + 60 * (minutes + 60 * hours);
        let closed_gov = reader.read_bit()?;
        let broken_link = reader.read_bit()?;
        debug!(
            "GOP: {:02}:{:02}:{:02}, closed={}, broken={}",
            hours, minutes, seconds, closed_gov, broken_link
        );
        Ok(())
    }

    /// 读取 user_data 并交给编码器识别
    pub(super) fn decode_user_data(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        let mut buf = Vec::with_capacity(32);
        while buf.len() < 255 && reader.bits_left() >= 23 {
            if reader.peek_bits(23)? == 0 {
                break;
            }
            buf.push(reader.read_bits(8)? as u8);
        }
        quirks::parse_user_data(&mut self.encoder, &buf);
        Ok(())
    }

    /// 读取一张自定义量化矩阵; 0 终止, 末值沿 zig-zag 序补全剩余位置
    fn read_quant_matrix(&mut self, reader: &mut BitReader, matrix: &mut [u16; 64]) -> MeiResult<()> {
        let mut last = 0u16;
        let mut i = 0usize;
        while i < 64 {
            if reader.bits_left() < 8 {
                return Err(MeiError::InvalidData("量化矩阵数据不完整".into()));
            }
            let v = reader.read_bits(8)? as u16;
            if v == 0 {
                break;
            }
            last = v;
            matrix[ZIGZAG_SCAN[i] as usize] = v;
            i += 1;
        }
        // 剩余位置用最后一个非零值填充
        while i < 64 {
            matrix[ZIGZAG_SCAN[i] as usize] = last;
            i += 1;
        }
        Ok(())
    }

    /// 解析 VOL 头部
    pub(super) fn decode_vol_header(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        reader.read_bit()?; // random_accessible_vol
        let vo_type = reader.read_bits(8)? as u8;
        if vo_type == VO_TYPE_SIMPLE_STUDIO || vo_type == VO_TYPE_CORE_STUDIO {
            self.seq.studio_profile = true;
            self.seq.vo_type = vo_type;
            return self.decode_studio_vol_header(reader);
        }
        if self.seq.studio_profile {
            return Err(MeiError::Unsupported(
                "studio profile 流中混入非 studio VOL".into(),
            ));
        }
        self.seq.vo_type = vo_type;

        if reader.read_bit()? == 1 {
            // is_object_layer_identifier
            self.seq.verid = reader.read_bits(4)? as u8;
            reader.skip_bits(3)?; // priority
        } else {
            self.seq.verid = 1;
        }

        let aspect_ratio_info = reader.read_bits(4)? as usize;
        if aspect_ratio_info == 0xF {
            let par_w = reader.read_bits(8)? as u8;
            let par_h = reader.read_bits(8)? as u8;
            self.pixel_aspect = (par_w, par_h);
        } else {
            self.pixel_aspect = *PIXEL_ASPECT.get(aspect_ratio_info).unwrap_or(&(0, 1));
        }

        self.seq.vol_control_parameters = reader.read_bit()? == 1;
        if self.seq.vol_control_parameters {
            let chroma_format = reader.read_bits(2)?;
            if chroma_format != 1 {
                error!("非法的 chroma_format: {}", chroma_format);
            }
            self.seq.low_delay = reader.read_bit()? == 1;
            if reader.read_bit()? == 1 {
                // vbv_parameters
                let mut bit_rate = reader.read_bits(15)?;
                check_marker(reader, "vbv first_half_bit_rate 之后")?;
                bit_rate = (bit_rate << 15) | reader.read_bits(15)?;
                check_marker(reader, "vbv latter_half_bit_rate 之后")?;
                let mut buffer_size = reader.read_bits(15)?;
                check_marker(reader, "vbv first_half_vbv_buffer_size 之后")?;
                buffer_size = (buffer_size << 3) | reader.read_bits(3)?;
                let mut occupancy = reader.read_bits(11)?;
                check_marker(reader, "vbv first_half_vbv_occupancy 之后")?;
                occupancy = (occupancy << 15) | reader.read_bits(15)?;
                check_marker(reader, "vbv latter_half_vbv_occupancy 之后")?;
                self.bit_rate = bit_rate.saturating_mul(400) as u64;
                debug!(
                    "vbv: bit_rate={} kbit/s, buffer={} bit, occupancy={}",
                    bit_rate * 400 / 1000,
                    buffer_size * 16384,
                    occupancy * 64
                );
            }
        } else if self.picture_number == 0 {
            // vol_control_parameters 缺席时按 profile 推定 low_delay
            self.seq.low_delay = vo_type == VO_TYPE_SIMPLE || vo_type == VO_TYPE_ADV_SIMPLE;
        }

        let shape = reader.read_bits(2)?;
        self.seq.shape = match shape {
            0 => VolShape::Rectangular,
            1 => VolShape::Binary,
            2 => VolShape::BinaryOnly,
            _ => VolShape::Grayscale,
        };
        if self.seq.shape != VolShape::Rectangular {
            warn!("仅矩形 VOL 被完整支持, shape={}", shape);
        }
        if self.seq.shape == VolShape::Grayscale && self.seq.verid != 1 {
            reader.skip_bits(4)?; // video_object_layer_shape_extension
        }

        check_marker(reader, "vol shape 之后")?;

        let time_res = reader.read_bits(16)?;
        if time_res == 0 {
            return Err(MeiError::InvalidData(
                "vop_time_increment_resolution 为 0".into(),
            ));
        }
        self.seq.time_increment_resolution = time_res;
        self.seq.time_increment_bits = if time_res > 1 {
            super::tables::floor_log2(time_res - 1) + 1
        } else {
            1
        };
        check_marker(reader, "time_increment_resolution 之后")?;

        if reader.read_bit()? == 1 {
            // fixed_vop_rate
            self.seq.fixed_vop_rate = reader.read_bits(self.seq.time_increment_bits as u32)?;
        } else {
            self.seq.fixed_vop_rate = 1;
        }

        if self.seq.shape != VolShape::BinaryOnly {
            if self.seq.shape == VolShape::Rectangular {
                check_marker(reader, "vol 宽度之前")?;
                let width = reader.read_bits(13)?;
                check_marker(reader, "vol 宽度之后")?;
                let height = reader.read_bits(13)?;
                check_marker(reader, "vol 高度之后")?;
                if width != 0 && height != 0 {
                    let keep_old = self.seq.width != 0
                        && (&self.codec_tag == b"MP4S" || &self.codec_tag == b"M4S2");
                    if !keep_old && (self.seq.width != width || self.seq.height != height) {
                        self.set_dimensions(width, height);
                    }
                }
            }

            self.seq.progressive = reader.read_bit()? == 0;
            if reader.read_bit()? == 0 {
                info!("OBMC 标志置位 (不支持, 忽略)");
            }

            let sprite_usage = if self.seq.verid == 1 {
                reader.read_bits(1)?
            } else {
                reader.read_bits(2)?
            };
            self.seq.sprite = match sprite_usage {
                1 => SpriteMode::Static,
                2 => SpriteMode::Gmc,
                _ => SpriteMode::None,
            };
            if self.seq.sprite == SpriteMode::Static {
                error!("静态 sprite 不支持");
            }
            if self.seq.sprite != SpriteMode::None {
                if self.seq.sprite == SpriteMode::Static {
                    // sprite 尺寸与偏移
                    for what in ["宽度", "高度", "左偏移", "上偏移"] {
                        reader.skip_bits(13)?;
                        check_marker(reader, what)?;
                    }
                }
                let points = reader.read_bits(6)? as u8;
                if points > 3 {
                    self.seq.num_sprite_warping_points = 0;
                    return Err(MeiError::InvalidData(format!(
                        "sprite warping point 数非法: {}",
                        points
                    )));
                }
                self.seq.num_sprite_warping_points = points;
                self.seq.sprite_warping_accuracy = reader.read_bits(2)? as u8;
                self.seq.sprite_brightness_change = reader.read_bit()? == 1;
                if self.seq.sprite == SpriteMode::Static {
                    reader.read_bit()?; // low_latency_sprite
                }
            }

            if reader.read_bit()? == 1 {
                // not_8_bit
                let precision = reader.read_bits(4)? as u8;
                self.seq.quant_precision = precision;
                if !(3..=9).contains(&precision) {
                    error!("quant_precision 非法: {}, 重置为 5", precision);
                    self.seq.quant_precision = 5;
                } else if precision != 5 {
                    info!("quant_precision={}", precision);
                }
                let bits_per_pixel = reader.read_bits(4)?;
                if bits_per_pixel != 8 {
                    info!("bits_per_pixel={} (仅 8 位被完整支持)", bits_per_pixel);
                }
            } else {
                self.seq.quant_precision = 5;
            }

            self.seq.mpeg_quant = reader.read_bit()? == 1;
            if self.seq.mpeg_quant {
                self.load_default_matrices();
                if reader.read_bit()? == 1 {
                    // load_intra_quant_mat
                    let mut m = self.intra_matrix;
                    self.read_quant_matrix(reader, &mut m)?;
                    self.intra_matrix = m;
                }
                if reader.read_bit()? == 1 {
                    // load_nonintra_quant_mat
                    let mut m = self.inter_matrix;
                    self.read_quant_matrix(reader, &mut m)?;
                    self.inter_matrix = m;
                }
            }

            if self.seq.verid != 1 {
                self.seq.quarter_sample = reader.read_bit()? == 1;
            }

            if reader.bits_left() < 4 {
                return Err(MeiError::InvalidData("VOL 头部被截断".into()));
            }

            self.decode_complexity_estimation(reader)?;

            self.seq.resync_marker = reader.read_bit()? == 0;

            self.seq.data_partitioned = reader.read_bit()? == 1;
            if self.seq.data_partitioned {
                self.seq.rvlc = reader.read_bit()? == 1;
            }

            if self.seq.verid != 1 {
                self.seq.new_pred = reader.read_bit()? == 1;
                if self.seq.new_pred {
                    error!("new pred 不支持");
                    reader.skip_bits(2)?; // requested upstream message type 与 segment type
                }
                if reader.read_bit()? == 1 {
                    error!("reduced resolution VOP 不支持");
                }
            }

            self.seq.scalability = reader.read_bit()? == 1;
            if self.seq.scalability {
                let pos = reader.bits_read();
                reader.read_bit()?; // hierarchy_type
                reader.skip_bits(4)?; // ref_layer_id
                reader.read_bit()?; // ref_layer_sampling_direc
                let h_factor_n = reader.read_bits(5)?;
                let h_factor_m = reader.read_bits(5)?;
                let v_factor_n = reader.read_bits(5)?;
                let v_factor_m = reader.read_bits(5)?;
                self.seq.enhancement_type = reader.read_bit()? == 1;
                if h_factor_n == 0 || h_factor_m == 0 || v_factor_n == 0 || v_factor_m == 0 {
                    // 采样因子为 0 说明这不是合法的 scalability 扩展, 回退重解
                    self.seq.scalability = false;
                    self.seq.enhancement_type = false;
                    reader.set_bit_position(pos)?;
                } else {
                    error!("scalability 不支持");
                }
            }
        }

        self.has_vol = true;
        debug!(
            "VOL: {}x{}, vo_type={}, verid={}, time_res={}, quant={}, \
             partitioned={}, sprite={:?}, qpel={}",
            self.seq.width,
            self.seq.height,
            vo_type,
            self.seq.verid,
            time_res,
            if self.seq.mpeg_quant { "mpeg" } else { "h263" },
            self.seq.data_partitioned,
            self.seq.sprite,
            self.seq.quarter_sample,
        );
        Ok(())
    }

    /// complexity estimation 头部字段: 逐项统计 VOP 头中需要跳过的位数
    ///
    /// marker 校验失败时按字段缺失处理, 回退读取位置并清零.
    fn decode_complexity_estimation(&mut self, reader: &mut BitReader) -> MeiResult<()> {
        self.seq.cplx_estimation_trash_i = 0;
        self.seq.cplx_estimation_trash_p = 0;
        self.seq.cplx_estimation_trash_b = 0;

        if reader.read_bit()? == 1 {
            // complexity_estimation_disable
            return Ok(());
        }

        let pos = reader.bits_read();
        let method = reader.read_bits(2)?;
        if method >= 2 {
            error!("非法的 complexity estimation method: {}", method);
            return Ok(());
        }

        if reader.read_bit()? == 0 {
            // shape_complexity_estimation_disable
            for _ in 0..6 {
                self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16;
            }
        }
        if reader.read_bit()? == 0 {
            // texture_complexity_estimation_set_1_disable
            self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16;
        }
        if !check_marker(reader, "complexity estimation 第一部分")? {
            reader.set_bit_position(pos)?;
            self.seq.cplx_estimation_trash_i = 0;
            self.seq.cplx_estimation_trash_p = 0;
            self.seq.cplx_estimation_trash_b = 0;
            return Ok(());
        }
        if reader.read_bit()? == 0 {
            // texture_complexity_estimation_set_2_disable
            self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_i += 4 * reader.read_bit()? as u16;
        }
        if reader.read_bit()? == 0 {
            // motion_compensation_complexity_disable
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_b += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16;
        }
        if !check_marker(reader, "complexity estimation 第二部分")? {
            reader.set_bit_position(pos)?;
            self.seq.cplx_estimation_trash_i = 0;
            self.seq.cplx_estimation_trash_p = 0;
            self.seq.cplx_estimation_trash_b = 0;
            return Ok(());
        }
        if method == 1 {
            self.seq.cplx_estimation_trash_i += 8 * reader.read_bit()? as u16; // sadct
            self.seq.cplx_estimation_trash_p += 8 * reader.read_bit()? as u16; // qpel
        }
        Ok(())
    }
}
