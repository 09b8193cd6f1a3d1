// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::io::Result;

fn main() -> Result<()> {
    prost_build::compile_protos(&["src/proto/locnet.proto"], &["src/"])?;

    Ok(())
}
