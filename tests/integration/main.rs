// Integration tests don't need module declarations like unit tests; this
// binary just groups the files in this directory.

mod common;
mod connection_test;
mod messaging_test;
mod reconnect_test;
mod rpc_test;
