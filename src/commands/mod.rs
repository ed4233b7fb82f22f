//! CLI command implementations
//!
//! Every command drives an emulated card; there is no hardware reader
//! backend.

mod inspect;
mod pending;
mod program;
mod resolve;

pub use inspect::run_inspect;
pub use pending::run_pending;
pub use program::{run_program, ProgramArgs};
pub use resolve::run_resolve;

use rfaccess_core::ProgramRequest;

/// Print a request and the block writes it lays out
pub fn print_request(request: &ProgramRequest) {
    let payload = request.payload();
    println!("Request: {}", request.id());
    println!("Blocks:  {}", payload.len());
    for write in payload.writes() {
        println!(
            "  sector {:>2}  block {:>3}  key {}  {}",
            write.sector,
            write.block,
            write.key.kind,
            to_hex(write.data())
        );
    }
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
