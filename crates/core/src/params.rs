//! Free-text parameter extraction.
//!
//! A generation request is a prompt followed by optional whole-word
//! tags, e.g. `a cat on a sofa 16:9 2MP 3x cfg=3.5 m=real`. Tags are
//! removed from the text and the remainder becomes the prompt.
//!
//! | Tag       | Example     | Meaning                         |
//! |-----------|-------------|---------------------------------|
//! | `WxH`     | `1920x1080` | explicit resolution             |
//! | `W:H`     | `16:9`      | aspect ratio (decimals allowed) |
//! | `NMP`     | `2MP`       | megapixel target                |
//! | `Nx`      | `3x`        | batch size                      |
//! | `s=N`     | `s=20`      | sampling steps                  |
//! | `cfg=N`   | `cfg=3.5`   | guidance                        |
//! | `m=name`  | `m=real`    | mode                            |
//! | `seed=N`  | `seed=42`   | fixed seed                      |
//! | `pe=name` | `pe=default`| prompt enhancement type         |

use std::str::FromStr;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::CoreError;
use crate::job::JobSpec;
use crate::modes::{ModeRegistry, DEFAULT_MODE};
use crate::resolution::{resolution_for_ratio, round_resolution, DEFAULT_MEGAPIXELS};
use crate::types::UserId;

/// Upper bound on the `Nx` batch multiplier.
pub const MAX_BATCH_SIZE: u32 = 32;

/// All tag patterns joined into one alternation, each anchored on word
/// boundaries. Order matters: `WxH` must be tried before `Nx`.
const TAG_PATTERN: &str = concat!(
    r"\b(?P<size_w>\d+)x(?P<size_h>\d+)\b",
    r"|\b(?P<ratio_w>\d+\.?\d*):(?P<ratio_h>\d+\.?\d*)\b",
    r"|\b(?P<mp>\d+\.?\d*)MP\b",
    r"|\b(?P<batch>\d+)x\b",
    r"|\bs=(?P<steps>\d+)\b",
    r"|\bcfg=(?P<cfg>\d+\.?\d*)\b",
    r"|\bm=(?P<mode>[a-zA-Z]+)\b",
    r"|\bseed=(?P<seed>\d+)\b",
    r"|\bpe=(?P<pe>\w+)\b",
);

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TAG_PATTERN).expect("valid tag regex"));

/// Raw tag values found in a message, before mode resolution.
///
/// When a tag appears more than once the last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedTags {
    pub size: Option<(u32, u32)>,
    pub ratio: Option<(f64, f64)>,
    pub megapixels: Option<f64>,
    pub batch_size: Option<u32>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub mode: Option<String>,
    pub seed: Option<u64>,
    pub prompt_enhance: Option<String>,
}

/// Split a message into its prompt and tag values.
///
/// The prompt is the message with every matched tag span removed,
/// trimmed of surrounding whitespace.
pub fn extract_tags(message: &str) -> Result<(String, ExtractedTags), CoreError> {
    let mut tags = ExtractedTags::default();
    let mut prompt = String::with_capacity(message.len());
    let mut last_end = 0;

    for caps in TAG_RE.captures_iter(message) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        prompt.push_str(&message[last_end..whole.start()]);
        last_end = whole.end();
        apply_tag(&caps, &mut tags)?;
    }
    prompt.push_str(&message[last_end..]);

    Ok((prompt.trim().to_string(), tags))
}

fn apply_tag(caps: &Captures<'_>, tags: &mut ExtractedTags) -> Result<(), CoreError> {
    if let (Some(w), Some(h)) = (caps.name("size_w"), caps.name("size_h")) {
        tags.size = Some((number(w.as_str())?, number(h.as_str())?));
    } else if let (Some(w), Some(h)) = (caps.name("ratio_w"), caps.name("ratio_h")) {
        tags.ratio = Some((number(w.as_str())?, number(h.as_str())?));
    } else if let Some(m) = caps.name("mp") {
        tags.megapixels = Some(number(m.as_str())?);
    } else if let Some(m) = caps.name("batch") {
        tags.batch_size = Some(number(m.as_str())?);
    } else if let Some(m) = caps.name("steps") {
        tags.steps = Some(number(m.as_str())?);
    } else if let Some(m) = caps.name("cfg") {
        tags.cfg = Some(number(m.as_str())?);
    } else if let Some(m) = caps.name("mode") {
        tags.mode = Some(m.as_str().to_string());
    } else if let Some(m) = caps.name("seed") {
        tags.seed = Some(number(m.as_str())?);
    } else if let Some(m) = caps.name("pe") {
        tags.prompt_enhance = Some(m.as_str().to_string());
    }
    Ok(())
}

fn number<T: FromStr>(raw: &str) -> Result<T, CoreError> {
    raw.parse()
        .map_err(|_| CoreError::InvalidParameter(format!("Invalid parameter value '{raw}'")))
}

/// Parse a generation request into a fully resolved [`JobSpec`].
///
/// Fails with [`CoreError::InvalidParameter`] for unknown modes and
/// out-of-range values. The seed stays unset unless the user fixed it.
pub fn parse(user_id: UserId, message: &str, modes: &ModeRegistry) -> Result<JobSpec, CoreError> {
    let (prompt, tags) = extract_tags(message)?;

    let megapixels = tags.megapixels.unwrap_or(DEFAULT_MEGAPIXELS);
    let (width, height) = match (tags.size, tags.ratio) {
        (Some((w, h)), _) => round_resolution(w, h)?,
        (None, Some((rw, rh))) => resolution_for_ratio(rw, rh, megapixels)?,
        (None, None) => resolution_for_ratio(1.0, 1.0, megapixels)?,
    };

    let batch_size = tags.batch_size.unwrap_or(1);
    if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
        return Err(CoreError::InvalidParameter(format!(
            "Batch size must be between 1 and {MAX_BATCH_SIZE} (got {batch_size})"
        )));
    }

    let mode_name = tags.mode.unwrap_or_else(|| DEFAULT_MODE.to_string());
    let mode = modes.resolve(&mode_name)?;

    let cfg = tags.cfg.unwrap_or(mode.cfg);
    if cfg <= 0.0 {
        return Err(CoreError::InvalidParameter(format!(
            "Guidance must be greater than 0 (got {cfg})"
        )));
    }
    let steps = tags.steps.unwrap_or(mode.steps);
    if steps == 0 {
        return Err(CoreError::InvalidParameter(
            "Steps must be greater than 0".to_string(),
        ));
    }

    Ok(JobSpec {
        user_id,
        prompt,
        batch_size,
        width,
        height,
        seed: tags.seed,
        cfg,
        steps,
        lora: mode.lora,
        lora_strength: mode.lora_strength,
        sampler: mode.sampler,
        scheduler: mode.scheduler,
        mode: mode_name,
        prompt_enhance: tags.prompt_enhance,
        prompt_template_pre_pe: mode.prompt_template_pre_pe,
        prompt_template_post_pe: mode.prompt_template_post_pe,
    })
}
