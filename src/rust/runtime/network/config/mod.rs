// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod middlebox;

//==============================================================================
// Exports
//==============================================================================

pub use self::middlebox::MiddleboxConfig;
