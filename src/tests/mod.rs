mod shared_region_selftest;
