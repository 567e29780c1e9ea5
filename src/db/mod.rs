pub mod dbscene;
