/*!
# privswap

Per-request privilege switching for worker processes started as root.

## Overview

A host that serves requests from many sites can start as root, then run
each request under the UID/GID of the site it belongs to and switch back
once the request is done. This crate provides the pieces to do it safely:

- Inspecting and narrowing the process capabilities to the few a worker needs
- Resolving the identity of a request from the owner of its document root
- Switching UID/GID in a way that can be reversed at the end of the request
- Confining the whole process, or a single request, to a directory with chroot

A [`Controller`] drives all of it through the life of a worker: startup,
request activation, request deactivation and shutdown.

## Example

```no_run
use privswap::{Config, Controller, HostModel, RequestContext};

fn main() -> privswap::Result<()> {
    let config = Config::default()
        .host(HostModel::Persistent)
        .default_ids(33, 33);

    let mut controller = Controller::system(config);
    controller.initialize()?;

    let ctx = RequestContext::new().document_root("/srv/sites/example/htdocs");
    controller.activate(&ctx)?;
    // serve the request as the owner of the document root...
    controller.deactivate()?;

    controller.shutdown()
}
```

## Ordering

1. The real root and the `nobody` user are looked up before any chroot
2. The global chroot, if any, is entered with chdir() then chroot(".")
3. Capabilities are reduced to what later requests need
4. Each request clears supplementary groups, then changes GID, then UID
5. Reversal restores UID first, then GID, then leaves the request root

With `secure` set (the default) any failure along the way is fatal.
*/

pub use self::caps::*;
pub use self::config::*;
pub use self::confine::*;
pub use self::credentials::*;
pub use self::diagnostics::*;
pub use self::errors::*;
pub use self::lifecycle::*;
pub use self::resolve::*;
pub use self::transition::*;

mod caps;
mod config;
mod confine;
mod credentials;
mod diagnostics;
mod errors;
mod lifecycle;
mod resolve;
mod transition;

/// Reexported dependencies for use in consuming crates.
///
/// Custom [`Credentials`] and [`RootFilesystem`] implementations deal in
/// `nix` types, so the exact version this crate uses is available here.
///
/// - `libc`: Low-level bindings to the C standard library
/// - `nix`: Rust friendly bindings to *nix APIs with user and filesystem features
pub mod reexports {
    pub use {libc, nix};
}
