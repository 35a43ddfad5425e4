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

//! Relay entry points for the local and remote endpoints

use std::future::Future;

use futures::future::{self, Either};
use futures::pin_mut;

pub mod flow;
pub mod local;
pub mod server;
pub mod socks5;
pub mod tcprelay;

/// Runs `fut` until it completes or [`crate::context::shutdown`] fires.
///
/// Returns `None` when the shutdown won; the future is dropped, which closes
/// any sockets it owned. Tasks must not write after that point, and none do:
/// dropping the halves is the teardown.
pub(crate) async fn until_shutdown<F: Future>(fut: F) -> Option<F::Output> {
    let shutdown = crate::context::wait_shutdown();
    pin_mut!(fut);
    pin_mut!(shutdown);

    match future::select(fut, shutdown).await {
        Either::Left((out, _)) => Some(out),
        Either::Right(..) => None,
    }
}
