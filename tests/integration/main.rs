//! Integration tests: both nodes wired over the in-memory link against
//! the simulated plant. These run on the host with a virtual clock.

mod end_to_end;
mod link_tests;
