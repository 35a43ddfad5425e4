// The MIT License (MIT)

// Copyright (c) 2020 jumptiger project developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Local side: SOCKS5 listener, optional HTTP listener, optional monitor

use std::io;

use futures::future::{self, FutureExt};

use crate::config::{Config, ConfigType};
use crate::context::Context;
use crate::monitor;
use crate::relay::tcprelay;

/// Runs the local end of the tunnel until shutdown or the first listener
/// error. Binding failures surface immediately.
pub async fn run_local(config: Config) -> io::Result<()> {
    debug_assert_eq!(config.config_type, ConfigType::Local);

    let context = Context::new(config);

    let mut vf = Vec::new();
    vf.push(tcprelay::local::run(context.clone()).boxed());

    if context.config().http_port.is_some() {
        vf.push(tcprelay::http_local::run(context.clone()).boxed());
    }

    if context.config().monitor_port.is_some() {
        vf.push(monitor::run(context.clone()).boxed());
    }

    let (result, ..) = future::select_all(vf).await;
    result
}
