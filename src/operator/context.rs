//! Shared context handed to kube-runtime controllers, and the finalizer
//! name they share.

use kube::Client;
use std::sync::Arc;

pub const FINALIZER_NAME: &str = "muster.dev/finalizer";

pub struct Context {
    pub client: Client,
}

impl Context {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self { client })
    }
}
