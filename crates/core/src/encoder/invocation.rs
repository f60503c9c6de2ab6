//! Pure construction of the FFmpeg argument vector for one HLS encode.

use hlsenc_config::VideoEncoder;
use std::path::{Path, PathBuf};

/// The four HLS renditions this crate always produces.
const VARIANT_DIMENSIONS: [(u32, u32); 4] = [(1920, 1080), (1280, 720), (854, 480), (640, 360)];

/// Immutable, per-attempt parameters handed to the encoder driver.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub encoder: VideoEncoder,
    pub fps: u32,
    pub include_audio: bool,
    pub has_audio_stream: bool,
    /// 1080p, 720p, 480p, 360p bitrates, e.g. `"6500k"`.
    pub bitrates: [String; 4],
    pub audio_bitrates: Vec<String>,
    pub hls_time_secs: u32,
}

/// A built, ready-to-spawn command line plus the `var_stream_map` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub var_stream_map: String,
}

/// Doubles a bitrate string such as `"6500k"`, preserving its unit suffix.
fn double_bitrate(bitrate: &str) -> String {
    let trimmed = bitrate.trim();
    let (digits, suffix) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let value: u64 = digits.parse().unwrap_or(0);
    format!("{}{}", value * 2, suffix)
}

fn audio_active(spec: &InvocationSpec) -> bool {
    spec.include_audio && spec.has_audio_stream
}

/// Builds the FFmpeg argument vector per the normative construction rules:
/// split=4 scaling chain, per-variant video params (no preset/tune for
/// h264_nvenc), conditional audio streams and var_stream_map, and the HLS
/// output parameters. Pure: no I/O, no filesystem access.
pub fn build_invocation(spec: &InvocationSpec) -> BuiltInvocation {
    let mut args: Vec<String> = Vec::new();

    args.push("-y".to_string());
    args.push("-i".to_string());
    args.push(spec.input_path.to_string_lossy().into_owned());

    let filter_complex = format!(
        "split=4[v1][v2][v3][v4];\
         [v1]scale=w={}:h={}[v1out];\
         [v2]scale=w={}:h={}[v2out];\
         [v3]scale=w={}:h={}[v3out];\
         [v4]scale=w={}:h={}[v4out]",
        VARIANT_DIMENSIONS[0].0,
        VARIANT_DIMENSIONS[0].1,
        VARIANT_DIMENSIONS[1].0,
        VARIANT_DIMENSIONS[1].1,
        VARIANT_DIMENSIONS[2].0,
        VARIANT_DIMENSIONS[2].1,
        VARIANT_DIMENSIONS[3].0,
        VARIANT_DIMENSIONS[3].1,
    );
    args.push("-filter_complex".to_string());
    args.push(filter_complex);

    for i in 0..4 {
        args.push("-map".to_string());
        args.push(format!("[v{}out]", i + 1));
    }

    let encoder_name = spec.encoder.ffmpeg_name();
    for (i, bitrate) in spec.bitrates.iter().enumerate() {
        let buf = double_bitrate(bitrate);
        args.push(format!("-c:v:{}", i));
        args.push(encoder_name.to_string());
        if let Some((preset, tune)) = spec.encoder.preset_tune() {
            args.push(format!("-preset:v:{}", i));
            args.push(preset.to_string());
            args.push(format!("-tune:v:{}", i));
            args.push(tune.to_string());
        }
        args.push(format!("-b:v:{}", i));
        args.push(bitrate.clone());
        args.push(format!("-maxrate:v:{}", i));
        args.push(bitrate.clone());
        args.push(format!("-bufsize:v:{}", i));
        args.push(buf);
    }

    let var_stream_map = if audio_active(spec) {
        for (i, bitrate) in spec.audio_bitrates.iter().enumerate() {
            args.push("-map".to_string());
            args.push("a:0".to_string());
            args.push(format!("-c:a:{}", i));
            args.push("aac".to_string());
            args.push(format!("-b:a:{}", i));
            args.push(bitrate.clone());
            args.push(format!("-ac:{}", i));
            args.push("2".to_string());
        }
        "v:0,a:0 v:1,a:1 v:2,a:2 v:3,a:3".to_string()
    } else {
        "v:0 v:1 v:2 v:3".to_string()
    };

    args.push("-f".to_string());
    args.push("hls".to_string());
    args.push("-g".to_string());
    args.push(spec.fps.to_string());
    args.push("-hls_time".to_string());
    args.push(spec.hls_time_secs.to_string());
    args.push("-hls_playlist_type".to_string());
    args.push("vod".to_string());
    args.push("-hls_flags".to_string());
    args.push("independent_segments".to_string());
    args.push("-hls_segment_type".to_string());
    args.push("mpegts".to_string());
    args.push("-var_stream_map".to_string());
    args.push(var_stream_map.clone());
    args.push("-master_pl_name".to_string());
    args.push("master.m3u8".to_string());
    args.push("-hls_segment_filename".to_string());
    args.push(segment_filename_template(&spec.output_dir));
    args.push(playlist_template(&spec.output_dir));

    BuiltInvocation {
        program: "ffmpeg".to_string(),
        args,
        var_stream_map,
    }
}

pub fn segment_filename_template(output_dir: &Path) -> String {
    output_dir
        .join("%v")
        .join("segment_%03d.ts")
        .to_string_lossy()
        .into_owned()
}

pub fn playlist_template(output_dir: &Path) -> String {
    output_dir
        .join("%v")
        .join("playlist.m3u8")
        .to_string_lossy()
        .into_owned()
}

pub fn master_playlist_path(output_dir: &Path) -> PathBuf {
    output_dir.join("master.m3u8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base_spec(encoder: VideoEncoder) -> InvocationSpec {
        InvocationSpec {
            input_path: PathBuf::from("/in/100-1.mp4"),
            output_dir: PathBuf::from("/out/100-1"),
            encoder,
            fps: 30,
            include_audio: true,
            has_audio_stream: true,
            bitrates: [
                "6500k".to_string(),
                "4000k".to_string(),
                "2000k".to_string(),
                "1000k".to_string(),
            ],
            audio_bitrates: vec!["128k".to_string()],
            hls_time_secs: 1,
        }
    }

    #[test]
    fn test_nvenc_has_no_preset_or_tune_tokens() {
        let spec = base_spec(VideoEncoder::H264Nvenc);
        let built = build_invocation(&spec);
        assert!(!built.args.iter().any(|a| a.starts_with("-preset")));
        assert!(!built.args.iter().any(|a| a.starts_with("-tune")));
        assert_eq!(
            built.args.iter().filter(|a| a.as_str() == "h264_nvenc").count(),
            4
        );
    }

    #[test]
    fn test_libx265_emits_preset_and_tune_per_variant() {
        let spec = base_spec(VideoEncoder::Libx265 {
            preset: "slow".to_string(),
            tune: "film".to_string(),
        });
        let built = build_invocation(&spec);
        for i in 0..4 {
            assert!(built.args.contains(&format!("-preset:v:{}", i)));
            assert!(built.args.contains(&format!("-tune:v:{}", i)));
        }
    }

    #[test]
    fn test_bufsize_is_double_bitrate() {
        let spec = base_spec(VideoEncoder::Libx264 {
            preset: "medium".to_string(),
            tune: "film".to_string(),
        });
        let built = build_invocation(&spec);
        let idx = built.args.iter().position(|a| a == "-bufsize:v:0").unwrap();
        assert_eq!(built.args[idx + 1], "13000k");
    }

    #[test]
    fn test_no_audio_var_stream_map_is_video_only() {
        let mut spec = base_spec(VideoEncoder::Libx265 {
            preset: "medium".to_string(),
            tune: "film".to_string(),
        });
        spec.has_audio_stream = false;
        let built = build_invocation(&spec);
        assert_eq!(built.var_stream_map, "v:0 v:1 v:2 v:3");
        assert!(!built.args.iter().any(|a| a == "aac"));
    }

    #[test]
    fn test_audio_requested_and_present_maps_pairs() {
        let spec = base_spec(VideoEncoder::Libx265 {
            preset: "medium".to_string(),
            tune: "film".to_string(),
        });
        let built = build_invocation(&spec);
        assert_eq!(built.var_stream_map, "v:0,a:0 v:1,a:1 v:2,a:2 v:3,a:3");
    }

    #[test]
    fn test_segment_and_playlist_paths() {
        let out = PathBuf::from("/out/100-1");
        assert_eq!(
            segment_filename_template(&out),
            "/out/100-1/%v/segment_%03d.ts"
        );
        assert_eq!(playlist_template(&out), "/out/100-1/%v/playlist.m3u8");
        assert_eq!(master_playlist_path(&out), PathBuf::from("/out/100-1/master.m3u8"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_build_invocation_is_pure(
            fps in 1u32..120,
            bitrate_kbps in 100u32..20_000,
        ) {
            let spec = InvocationSpec {
                input_path: PathBuf::from("/in/1-1.mp4"),
                output_dir: PathBuf::from("/out/1-1"),
                encoder: VideoEncoder::Libx265 { preset: "medium".to_string(), tune: "film".to_string() },
                fps,
                include_audio: false,
                has_audio_stream: false,
                bitrates: [
                    format!("{}k", bitrate_kbps),
                    format!("{}k", bitrate_kbps / 2),
                    format!("{}k", bitrate_kbps / 4),
                    format!("{}k", bitrate_kbps / 8),
                ],
                audio_bitrates: vec![],
                hls_time_secs: 1,
            };

            let a = build_invocation(&spec);
            let b = build_invocation(&spec);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_bufsize_always_doubles_bitrate(bitrate_kbps in 1u32..50_000) {
            let doubled = double_bitrate(&format!("{}k", bitrate_kbps));
            prop_assert_eq!(doubled, format!("{}k", bitrate_kbps * 2));
        }
    }
}
