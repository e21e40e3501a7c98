pub mod readsb;
