mod broadcast_tests;
