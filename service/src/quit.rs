//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//


//! Quit protocol
//!
//! A client leaves by sending the literal line `\quit`. The sentinel is
//! recognised immediately after framing and is never broadcast.

/// Line that terminates the sending connection
pub const QUIT_SENTINEL: &str = "\\quit";

/// What the relay does with one decoded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAction {
    /// Broadcast the line to every other client
    Forward(String),
    /// Close the sending connection without broadcasting
    Quit,
    /// Drop the line (empty input)
    Ignore,
}

/// Classify a decoded line
///
/// The sentinel match is exact and case-sensitive; `\QUIT` or `\quit now`
/// are ordinary messages.
pub fn classify(line: String) -> LineAction {
    if line == QUIT_SENTINEL {
        LineAction::Quit
    } else if line.is_empty() {
        LineAction::Ignore
    } else {
        LineAction::Forward(line)
    }
}

/// Check whether a line is the quit sentinel
pub fn is_quit(line: &str) -> bool {
    line == QUIT_SENTINEL
}
