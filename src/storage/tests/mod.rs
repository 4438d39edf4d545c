mod tests_file;
