// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection_registry;
pub mod fanout;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;
