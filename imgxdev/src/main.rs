mod application;

mod presentation {
    pub mod cli;
}

use imgx_core::error::Result;

fn main() -> Result<()> {
    application::run()
}
