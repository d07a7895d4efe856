// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Ensures the log facade is hooked up at most once, however many pipeline elements get instantiated.
static LOGGER_INIT: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Hooks the `log` macros used across the interception pipeline (per-flow traces, drop warnings) up to a
/// flexi_logger backend configured from the `RUST_LOG` environment variable. Every element constructor may call
/// this; only the first call takes effect.
pub fn initialize() {
    LOGGER_INIT.call_once(|| {
        Logger::try_with_env()
            .expect("malformed RUST_LOG specification")
            .start()
            .expect("another logger is already installed");
    });
}
