//! Format selection.
//!
//! Picks one (width, height, framerate) from the device's H.264 capability
//! list, highest resolution first and highest framerate second, subject to
//! whatever the downstream consumer accepts.

use std::ops::RangeInclusive;

use thiserror::Error;
use tracing::{debug, info};

use crate::timing;

/// UVC frame intervals are expressed in 100 ns units.
const UVC_INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no compatible format among {candidates} device capabilities")]
    NoCompatibleFormat { candidates: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRates {
    Discrete(Vec<u32>),
    Range { min: u32, max: u32 },
}

impl FrameRates {
    /// Highest framerate the device offers, ignoring any constraint.
    pub fn max(&self) -> Option<u32> {
        match self {
            FrameRates::Discrete(rates) => rates.iter().copied().max(),
            FrameRates::Range { max, .. } => Some(*max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub width: u32,
    pub height: u32,
    pub framerates: FrameRates,
}

impl Capability {
    pub fn discrete(width: u32, height: u32, framerates: impl Into<Vec<u32>>) -> Self {
        Self {
            width,
            height,
            framerates: FrameRates::Discrete(framerates.into()),
        }
    }

    pub fn range(width: u32, height: u32, min: u32, max: u32) -> Self {
        Self {
            width,
            height,
            framerates: FrameRates::Range { min, max },
        }
    }

    /// From a UVC frame descriptor's discrete interval list (100 ns units).
    /// Zero intervals are ignored.
    pub fn from_uvc_intervals(width: u32, height: u32, intervals: &[u32]) -> Self {
        let rates = intervals
            .iter()
            .filter(|&&i| i > 0)
            .map(|&i| UVC_INTERVAL_UNITS_PER_SEC / i)
            .collect::<Vec<_>>();
        Self::discrete(width, height, rates)
    }

    /// From a UVC stepwise descriptor. The shortest interval gives the
    /// highest framerate.
    pub fn from_uvc_interval_range(
        width: u32,
        height: u32,
        min_interval: u32,
        max_interval: u32,
    ) -> Self {
        let fps = |i: u32| UVC_INTERVAL_UNITS_PER_SEC / i.max(1);
        Self::range(width, height, fps(max_interval), fps(min_interval))
    }

    pub fn resolution(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// What the downstream consumer accepts.
pub trait FormatConstraint {
    /// Framerate to run `cap` at, or `None` if the constraint rejects it.
    fn best_framerate(&self, cap: &Capability) -> Option<u32>;
}

/// Accepts the device's best.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconstrained;

impl FormatConstraint for Unconstrained {
    fn best_framerate(&self, cap: &Capability) -> Option<u32> {
        cap.framerates.max().filter(|&fps| fps > 0)
    }
}

/// Simple bounds on size and framerate, for hosts without a caps system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatFilter {
    width: Option<RangeInclusive<u32>>,
    height: Option<RangeInclusive<u32>>,
    framerate: Option<RangeInclusive<u32>>,
}

impl FormatFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width..=width);
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.height = Some(height..=height);
        self
    }

    pub fn max_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(0..=width);
        self.height = Some(0..=height);
        self
    }

    pub fn framerate(mut self, fps: u32) -> Self {
        self.framerate = Some(fps..=fps);
        self
    }

    pub fn framerate_range(mut self, min: u32, max: u32) -> Self {
        self.framerate = Some(min..=max);
        self
    }

    fn accepts_size(&self, cap: &Capability) -> bool {
        self.width.as_ref().map_or(true, |w| w.contains(&cap.width))
            && self.height.as_ref().map_or(true, |h| h.contains(&cap.height))
    }
}

impl FormatConstraint for FormatFilter {
    fn best_framerate(&self, cap: &Capability) -> Option<u32> {
        if !self.accepts_size(cap) {
            return None;
        }
        let allowed = self.framerate.clone().unwrap_or(1..=u32::MAX);
        match &cap.framerates {
            FrameRates::Discrete(rates) => rates
                .iter()
                .copied()
                .filter(|fps| *fps > 0 && allowed.contains(fps))
                .max(),
            FrameRates::Range { min, max } => {
                // Nearest to the device maximum within the overlap.
                let hi = (*max).min(*allowed.end());
                let lo = (*min).max(*allowed.start()).max(1);
                (lo <= hi).then_some(hi)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl SelectedFormat {
    /// Nominal frame interval that seeds the timestamp synchronizer.
    pub fn frame_interval_ns(&self) -> u64 {
        timing::interval_for_framerate(self.framerate)
    }
}

/// Best capability under `constraint`, ordered by `(width * height,
/// framerate)`. The first of equal candidates wins.
pub fn select_format<C>(
    capabilities: &[Capability],
    constraint: &C,
) -> Result<SelectedFormat, NegotiationError>
where
    C: FormatConstraint + ?Sized,
{
    let mut best: Option<(u64, SelectedFormat)> = None;
    for cap in capabilities {
        let Some(framerate) = constraint.best_framerate(cap) else {
            debug!(
                "Capability {}x{} {:?} rejected by constraint",
                cap.width, cap.height, cap.framerates
            );
            continue;
        };
        let resolution = cap.resolution();
        let better = match &best {
            None => true,
            Some((res, sel)) => (resolution, framerate) > (*res, sel.framerate),
        };
        if better {
            best = Some((
                resolution,
                SelectedFormat {
                    width: cap.width,
                    height: cap.height,
                    framerate,
                },
            ));
        }
    }

    match best {
        Some((_, selected)) => {
            info!(
                "Selected {}x{} @ {} fps",
                selected.width, selected.height, selected.framerate
            );
            Ok(selected)
        }
        None => Err(NegotiationError::NoCompatibleFormat {
            candidates: capabilities.len(),
        }),
    }
}
