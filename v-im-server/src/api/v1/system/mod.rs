pub mod ip_blacklist;
