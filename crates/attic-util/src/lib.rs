// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod health;
pub mod ident;
pub mod metrics;
pub mod retry;
