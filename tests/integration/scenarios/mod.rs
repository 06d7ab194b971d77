pub mod cli_tests;
