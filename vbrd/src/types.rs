// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the bridge daemon.

use crate::datapath::DatapathError;

use std::convert;

pub type VbrdResult<T> = Result<T, VbrdError>;

#[derive(Debug, thiserror::Error)]
pub enum VbrdError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("datapath error: {0}")]
    Datapath(#[from] DatapathError),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Error: {0}")]
    Other(String),
}

impl convert::From<std::io::Error> for VbrdError {
    fn from(err: std::io::Error) -> Self {
        VbrdError::Io(err)
    }
}

impl convert::From<String> for VbrdError {
    fn from(err: String) -> Self {
        VbrdError::Other(err)
    }
}

impl convert::From<&str> for VbrdError {
    fn from(err: &str) -> Self {
        VbrdError::Other(err.to_string())
    }
}

impl convert::From<common::network::MacError> for VbrdError {
    fn from(err: common::network::MacError) -> Self {
        VbrdError::Invalid(err.to_string())
    }
}

impl convert::From<common::network::VlanError> for VbrdError {
    fn from(err: common::network::VlanError) -> Self {
        VbrdError::Invalid(err.to_string())
    }
}
