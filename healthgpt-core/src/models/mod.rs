pub mod phi3;
