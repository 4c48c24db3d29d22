//! Measure how invisible image watermarks survive degradation.
//!
//! For every image, method and attack the harness embeds a payload once,
//! applies the attack at increasing severities and decodes each result. The
//! first severity at which the payload no longer decodes is the breaking
//! point. Perceptual distances between every attacked image and the clean
//! watermarked copy are then joined onto the decode tables, and the merged
//! tables are aggregated into per-attack summaries.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use watermark_robustness::{ExperimentConfig, Harness};
//!
//! let harness = Harness::new(ExperimentConfig::default(), "results")?;
//! for summary in harness.run_directory(Path::new("images/resized")) {
//!     println!("{} {} {}: {:?}", summary.path.display(), summary.method, summary.attack, summary.first_failure);
//! }
//! let scorer = harness.scorer()?;
//! harness.score(scorer.as_ref())?;
//! harness.merge()?;
//! let report = harness.summarize()?;
//! println!("{}", watermark_robustness::report::render_markdown(&report.rows));
//! # Ok::<(), watermark_robustness::Error>(())
//! ```
//!
//! # Single sweeps
//!
//! The stages are usable on their own. A sweep needs only an image, a codec
//! and an attack:
//!
//! ```no_run
//! use watermark_robustness::attack::{Attack, AttackKind};
//! use watermark_robustness::codec::CodecRegistry;
//! use watermark_robustness::sweep::{sweep, SeveritySchedule};
//!
//! let img = image::open("photo.png")?.to_rgb8();
//! let codec = CodecRegistry::with_builtin(7).get("dctQim")?;
//! let attack = Attack::new(AttackKind::Jpeg);
//! let out = sweep(&img, codec.as_ref(), &attack, &SeveritySchedule::default_for(AttackKind::Jpeg), "qingquan")?;
//! println!("breaks at quality {:?}", out.first_failure());
//! # Ok::<(), watermark_robustness::Error>(())
//! ```

#![deny(missing_docs)]

pub mod attack;
pub mod codec;
mod config;
pub mod dataset;
pub mod error;
mod harness;
pub mod layout;
pub mod merge;
pub mod perceptual;
pub mod report;
pub mod severity;
pub mod sweep;
pub mod table;

pub use config::{AttackPlan, ExperimentConfig, DEFAULT_PAYLOAD, DEFAULT_VARIANT};
pub use error::{Error, Result};
pub use harness::{image_name, is_supported_image, save_image, Harness, SweepSummary};
