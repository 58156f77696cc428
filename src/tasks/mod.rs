pub mod poll_sweeper;
