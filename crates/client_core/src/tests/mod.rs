mod support;

mod presence_reaction_tests;
