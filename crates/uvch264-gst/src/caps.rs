//! Caps glue between the format selector and GStreamer negotiation.

use uvch264_core::format::{Capability, FormatConstraint, FrameRates, SelectedFormat};

const MEDIA_TYPE: &str = "video/x-h264";

fn fraction(fps: u32) -> gst::Fraction {
    gst::Fraction::new(i32::try_from(fps).unwrap_or(i32::MAX), 1)
}

fn dimension(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Whole frames per second, rounded. `None` for non-positive rates.
fn fps_of(f: gst::Fraction) -> Option<u32> {
    let (n, d) = (i64::from(f.numer()), i64::from(f.denom()));
    if n <= 0 || d <= 0 {
        return None;
    }
    u32::try_from((n + d / 2) / d).ok().filter(|&fps| fps > 0)
}

/// What the src pad can ever produce.
pub fn template_caps() -> gst::Caps {
    gst::Caps::builder(MEDIA_TYPE)
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build()
}

/// One device capability as caps. Discrete rates become a list of
/// fractions, UVC interval ranges a fraction range. A range that is empty
/// or inverted advertises its maximum only.
pub fn capability_caps(cap: &Capability) -> gst::Caps {
    let builder = gst::Caps::builder(MEDIA_TYPE)
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .field("width", dimension(cap.width))
        .field("height", dimension(cap.height));
    match &cap.framerates {
        FrameRates::Discrete(rates) => builder
            .field(
                "framerate",
                gst::List::new(rates.iter().filter(|&&r| r > 0).map(|&r| fraction(r))),
            )
            .build(),
        // A fraction range needs min < max; anything else is one fixed rate.
        FrameRates::Range { min, max } if (*min).max(1) < *max => builder
            .field(
                "framerate",
                gst::FractionRange::new(fraction((*min).max(1)), fraction(*max)),
            )
            .build(),
        FrameRates::Range { max, .. } => builder.field("framerate", fraction(*max)).build(),
    }
}

/// Fixed caps for the negotiated format.
pub fn output_caps(format: &SelectedFormat) -> gst::Caps {
    gst::Caps::builder(MEDIA_TYPE)
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .field("width", dimension(format.width))
        .field("height", dimension(format.height))
        .field("framerate", fraction(format.framerate))
        .build()
}

/// Downstream caps as a selector constraint.
///
/// A capability is acceptable when its caps intersect the peer caps; the
/// framerate is the intersection fixated nearest the capability's maximum.
#[derive(Debug, Clone)]
pub struct CapsConstraint {
    peer: gst::Caps,
}

impl CapsConstraint {
    pub fn new(peer: gst::Caps) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &gst::Caps {
        &self.peer
    }
}

impl FormatConstraint for CapsConstraint {
    fn best_framerate(&self, cap: &Capability) -> Option<u32> {
        let target = cap.framerates.max().filter(|&fps| fps > 0)?;
        let candidate = capability_caps(cap);
        if !self.peer.can_intersect(&candidate) {
            return None;
        }
        let mut common = self.peer.intersect(&candidate);
        common
            .make_mut()
            .iter_mut()
            .filter_map(|s| {
                s.fixate_field_nearest_fraction("framerate", fraction(target));
                s.get::<gst::Fraction>("framerate").ok().and_then(fps_of)
            })
            .max()
    }
}
