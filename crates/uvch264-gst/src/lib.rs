//! GStreamer plugin for H.264 UVC capture.
//!
//! - `uvch264src`: live H.264 source producing keyframe-first access units with
//!   SPS/PPS injected and capture timestamps smoothed

use gst::glib;

pub mod caps;
pub mod src;
mod util;

fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    src::register(Some(plugin))?;
    Ok(())
}

gst::plugin_define!(
    uvch264,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    env!("CARGO_PKG_VERSION"),
    "LGPL",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
